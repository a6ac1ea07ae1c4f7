//! Route matching: find the HTTP routes of a table that forward to the rollout's
//! stable (and possibly canary) service.

use kube::ResourceExt;
use routeshift_core::{fold_eq, HttpRoute, RolloutContext, RouteError, RouteResult, RouteTable, SimpleRouteSelector};
use tracing::debug;

/// A matched HTTP route, addressed by index into `spec.http` and into its
/// `forwardTo.destinations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedHttpRoute {
    pub route: usize,
    pub stable: usize,
    /// `None` until a canary destination is synthesized.
    pub canary: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct MatchedRouteTable {
    pub table: RouteTable,
    pub http_routes: Vec<MatchedHttpRoute>,
}

impl MatchedRouteTable {
    /// `namespace/name`, for logs and error context.
    pub fn key(&self) -> String { table_key(&self.table) }

    pub fn route(&self, m: &MatchedHttpRoute) -> Option<&HttpRoute> { self.table.spec.http.get(m.route) }
}

pub fn table_key(table: &RouteTable) -> String {
    format!("{}/{}", table.namespace().unwrap_or_default(), table.name_any())
}

/// Route-level pre-filter. Label keys missing from the route do not count as a
/// mismatch; only keys present on the route must agree.
pub fn route_selected(route: &HttpRoute, selector: Option<&SimpleRouteSelector>, table: &str) -> bool {
    let Some(sel) = selector else { return true };
    if !sel.name.is_empty() && !fold_eq(&sel.name, &route.name) {
        debug!(table, route = %route.name, selector = %sel.name, "skipping route: name selector mismatch");
        return false;
    }
    for (k, v) in sel.labels.iter() {
        if let Some(actual) = route.labels.get(k) {
            if !fold_eq(v, actual) {
                debug!(table, route = %route.name, label = %k, want = %v, got = %actual, "skipping route: label mismatch");
                return false;
            }
        }
    }
    true
}

/// Locate stable/canary destinations by service name; first occurrence wins.
fn find_destinations(route: &HttpRoute, rollout: &RolloutContext, table: &str) -> (Option<usize>, Option<usize>) {
    let (mut stable, mut canary) = (None, None);
    for (i, dest) in route.destinations().iter().enumerate() {
        let Some(name) = dest.ref_name() else {
            debug!(table, route = %route.name, idx = i, "skipping destination without ref");
            continue;
        };
        if stable.is_none() && fold_eq(name, &rollout.stable_service) {
            debug!(table, route = %route.name, dest = %name, "matched stable ref");
            stable = Some(i);
        } else if canary.is_none() && fold_eq(name, &rollout.canary_service) {
            debug!(table, route = %route.name, dest = %name, "matched canary ref");
            canary = Some(i);
        }
        if stable.is_some() && canary.is_some() {
            break;
        }
    }
    (stable, canary)
}

/// Match one table's HTTP routes against the rollout. Takes ownership of the table;
/// callers keep their own copy of the original for diffing.
pub fn match_routes(table: RouteTable, rollout: &RolloutContext) -> RouteResult<MatchedRouteTable> {
    if table.metadata.name.as_deref().unwrap_or("").is_empty() {
        return Err(RouteError::Match("route table without metadata.name cannot be matched".into()));
    }
    if rollout.stable_service.is_empty() {
        return Err(RouteError::Match(format!("no stable service to match in {}", table_key(&table))));
    }
    let key = table_key(&table);
    let mut http_routes = Vec::new();
    for (idx, route) in table.spec.http.iter().enumerate() {
        if route.forward_to.is_none() {
            debug!(table = %key, route = %route.name, "skipping route without forwardTo");
            continue;
        }
        if !route_selected(route, rollout.route_selector.as_ref(), &key) {
            continue;
        }
        if let (Some(stable), canary) = find_destinations(route, rollout, &key) {
            http_routes.push(MatchedHttpRoute { route: idx, stable, canary });
        }
    }
    debug!(table = %key, matched = http_routes.len(), "matched routes");
    Ok(MatchedRouteTable { table, http_routes })
}

/// Match every candidate table. A table that fails is recorded and skipped so the
/// remaining tables are still processed.
pub fn match_tables(tables: Vec<RouteTable>, rollout: &RolloutContext) -> (Vec<MatchedRouteTable>, Vec<RouteError>) {
    let mut matched = Vec::with_capacity(tables.len());
    let mut errors = Vec::new();
    for t in tables {
        match match_routes(t, rollout) {
            Ok(m) => matched.push(m),
            Err(e) => errors.push(e),
        }
    }
    (matched, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;

    #[test]
    fn matches_stable_and_canary_case_insensitively() {
        let rt = table("rt1", vec![route("r1", vec![dest("SVC-S", 80), dest("svc-c", 20)])]);
        let m = match_routes(rt, &rollout()).unwrap();
        assert_eq!(m.http_routes, vec![MatchedHttpRoute { route: 0, stable: 0, canary: Some(1) }]);
    }

    #[test]
    fn routes_without_stable_or_forward_are_ignored() {
        let mut inert = route("delegated", vec![]);
        inert.forward_to = None;
        let rt = table("rt1", vec![
            inert,
            route("canary-only", vec![dest("svc-c", 100)]),
            route("other", vec![dest("svc-x", 100)]),
            route("r1", vec![dest("svc-s", 100)]),
        ]);
        let m = match_routes(rt, &rollout()).unwrap();
        assert_eq!(m.http_routes, vec![MatchedHttpRoute { route: 3, stable: 0, canary: None }]);
    }

    #[test]
    fn first_occurrence_wins_for_duplicate_destinations() {
        let rt = table("rt1", vec![route("r1", vec![dest("svc-s", 60), dest("svc-s", 40), dest("svc-c", 0), dest("svc-c", 0)])]);
        let m = match_routes(rt, &rollout()).unwrap();
        assert_eq!(m.http_routes[0], MatchedHttpRoute { route: 0, stable: 0, canary: Some(2) });
    }

    #[test]
    fn destinations_without_ref_are_skipped() {
        let mut r = route("r1", vec![dest("svc-s", 100)]);
        r.forward_to.as_mut().unwrap().destinations.insert(0, Default::default());
        let m = match_routes(table("rt1", vec![r]), &rollout()).unwrap();
        assert_eq!(m.http_routes[0].stable, 1);
    }

    #[test]
    fn route_name_selector_excludes_other_routes() {
        let mut ctx = rollout();
        ctx.route_selector = Some(SimpleRouteSelector { name: "R2".into(), ..Default::default() });
        let rt = table("rt1", vec![route("r1", vec![dest("svc-s", 100)]), route("r2", vec![dest("svc-s", 100)])]);
        let m = match_routes(rt, &ctx).unwrap();
        assert_eq!(m.http_routes.len(), 1);
        assert_eq!(m.http_routes[0].route, 1);
    }

    #[test]
    fn label_selector_ignores_keys_absent_from_route() {
        let sel = SimpleRouteSelector {
            labels: [("canary".to_string(), "TRUE".to_string()), ("team".to_string(), "web".to_string())].into(),
            ..Default::default()
        };
        let mut labelled = route("r1", vec![]);
        labelled.labels.insert("canary".into(), "true".into());
        assert!(route_selected(&labelled, Some(&sel), "rt1"));
        assert!(route_selected(&route("bare", vec![]), Some(&sel), "rt1"));

        labelled.labels.insert("team".into(), "api".into());
        assert!(!route_selected(&labelled, Some(&sel), "rt1"));
    }

    #[test]
    fn nameless_table_is_a_match_error_but_others_continue() {
        let mut bad = table("rt-bad", vec![]);
        bad.metadata.name = None;
        let good = table("rt1", vec![route("r1", vec![dest("svc-s", 100)])]);
        let (matched, errors) = match_tables(vec![bad, good], &rollout());
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].key(), "apps/rt1");
        assert!(matches!(errors.as_slice(), [RouteError::Match(_)]));
    }
}
