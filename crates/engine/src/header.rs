//! Header routes: high-priority routes that send requests matching a set of header
//! predicates straight to the canary, ahead of the weighted split.

use routeshift_core::{
    fold_eq, ForwardToAction, HeaderMatcher, HeaderRoutingMatch, HeaderValue, HttpRequestMatcher, HttpRoute,
    RouteError, RouteResult,
};
use tracing::debug;

use crate::matcher::{MatchedHttpRoute, MatchedRouteTable};
use crate::weight::canary_from_stable;

/// Build the composite matcher for a header route; every rule must hold.
pub fn build_header_matcher(route_name: &str, rules: &[HeaderRoutingMatch]) -> RouteResult<HttpRequestMatcher> {
    if rules.is_empty() {
        return Err(RouteError::Config(format!("header route {} has no match rules", route_name)));
    }
    let mut headers = Vec::with_capacity(rules.len());
    for rule in rules {
        if rule.header_name.is_empty() {
            return Err(RouteError::Config(format!("header route {}: headerName is required", route_name)));
        }
        let (value, regex) = match rule.header_value.value()? {
            HeaderValue::Exact(v) => (v, false),
            HeaderValue::Regex(v) => {
                regex::Regex::new(&v).map_err(|e| {
                    RouteError::Config(format!("header route {}: invalid regex for {}: {}", route_name, rule.header_name, e))
                })?;
                (v, true)
            }
            HeaderValue::Prefix(p) => (format!("^{}", regex::escape(&p)), true),
        };
        headers.push(HeaderMatcher { name: rule.header_name.clone(), value: Some(value), regex, invert_match: false });
    }
    Ok(HttpRequestMatcher { name: Some(format!("{}-matcher", route_name)), headers, extra: Default::default() })
}

/// Canary-only forward action for a matched route: the existing canary if there is
/// one, otherwise one derived from stable. Weight is always 0 (unsplit traffic).
pub fn canary_forward(m: &MatchedRouteTable, mr: &MatchedHttpRoute, canary_service: &str) -> Option<ForwardToAction> {
    let route = m.route(mr)?;
    let fw = route.forward_to.as_ref()?;
    let mut dest = match mr.canary.and_then(|i| fw.destinations.get(i)) {
        Some(canary) => canary.clone(),
        None => canary_from_stable(fw.destinations.get(mr.stable)?, canary_service),
    };
    dest.weight = 0;
    Some(ForwardToAction { destinations: vec![dest], extra: fw.extra.clone() })
}

/// Prepend one header route per matched route. Routes already carrying the header
/// route's (non-empty) name are replaced, so repeated calls do not stack copies.
/// Returns the number of header routes written.
pub fn synthesize_header_routes(
    m: &mut MatchedRouteTable,
    matcher: &HttpRequestMatcher,
    route_name: &str,
    canary_service: &str,
) -> usize {
    let mut header_routes: Vec<HttpRoute> = Vec::with_capacity(m.http_routes.len());
    for mr in m.http_routes.iter() {
        let (Some(base), Some(forward)) = (m.route(mr), canary_forward(m, mr, canary_service)) else {
            debug!(table = %m.key(), "no canary resolvable for matched route; skipping");
            continue;
        };
        let mut matchers = Vec::with_capacity(base.matchers.len() + 1);
        matchers.push(matcher.clone());
        matchers.extend(base.matchers.iter().cloned());
        header_routes.push(HttpRoute {
            name: route_name.to_string(),
            labels: Default::default(),
            matchers,
            forward_to: Some(forward),
            extra: base.extra.clone(),
        });
    }

    let added = header_routes.len();
    let old = std::mem::take(&mut m.table.spec.http);
    let mut remap: Vec<Option<usize>> = Vec::with_capacity(old.len());
    let mut next = header_routes;
    for r in old {
        if !route_name.is_empty() && fold_eq(&r.name, route_name) {
            remap.push(None);
        } else {
            remap.push(Some(next.len()));
            next.push(r);
        }
    }
    m.table.spec.http = next;
    m.http_routes = m
        .http_routes
        .iter()
        .filter_map(|mr| remap.get(mr.route).copied().flatten().map(|route| MatchedHttpRoute { route, ..*mr }))
        .collect();
    debug!(table = %m.key(), added, name = %route_name, "header routes prepended");
    added
}
