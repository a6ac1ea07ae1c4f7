//! Routeshift core types: route tables, rollouts, plugin configuration and errors.

#![forbid(unsafe_code)]

pub mod config;
pub mod rollout;
pub mod route_table;

use serde::{Deserialize, Serialize};

pub use config::{PluginConfig, SimpleObjectSelector, SimpleRouteSelector};
pub use rollout::{HeaderRoutingMatch, HeaderValue, Rollout, SetHeaderRoute, StringMatch, WeightDestination};
pub use route_table::{
    DestinationReference, ForwardToAction, HeaderMatcher, HttpRequestMatcher, HttpRoute, ObjectReference,
    PortSelector, RouteTable, RouteTableSpec,
};

/// Key of this router's entry in `trafficRouting.plugins`.
pub const PLUGIN_NAME: &str = "solo-io/glooplatform";
/// Router type reported to the rollout controller.
pub const ROUTER_TYPE: &str = "GlooPlatformAPI";

/// Engine errors. Every failure of a routing operation ends up as one of these.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum RouteError {
    #[error("config: {0}")]
    Config(String),
    #[error("selector: {0}")]
    Selector(String),
    #[error("match: {0}")]
    Match(String),
    #[error("store: {0}")]
    Store(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("{}", join_errors(.0))]
    Combined(Vec<RouteError>),
}

pub type RouteResult<T> = Result<T, RouteError>;

fn join_errors(errs: &[RouteError]) -> String {
    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n")
}

impl RouteError {
    /// Fold accumulated per-table errors into a single result.
    /// One error is returned as-is; nested combined errors are flattened.
    pub fn combine(errs: Vec<RouteError>) -> RouteResult<()> {
        let mut flat = Vec::with_capacity(errs.len());
        for e in errs {
            match e {
                RouteError::Combined(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(RouteError::Combined(flat)),
        }
    }
}

/// Case-insensitive name comparison used for every route/service identity check.
pub fn fold_eq(a: &str, b: &str) -> bool {
    if a.len() == b.len() && a.eq_ignore_ascii_case(b) {
        return true;
    }
    a.chars().flat_map(char::to_lowercase).eq(b.chars().flat_map(char::to_lowercase))
}

/// Per-invocation view of the rollout: everything the engine needs, already resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutContext {
    pub name: String,
    pub namespace: String,
    pub stable_service: String,
    pub canary_service: String,
    pub table_selector: Option<SimpleObjectSelector>,
    pub route_selector: Option<SimpleRouteSelector>,
    /// Non-empty names listed under `trafficRouting.managedRoutes`.
    pub managed_routes: Vec<String>,
}

impl RolloutContext {
    pub fn from_rollout(rollout: &Rollout) -> RouteResult<Self> {
        use kube::ResourceExt;

        let canary = rollout
            .spec
            .strategy
            .canary
            .as_ref()
            .ok_or_else(|| RouteError::Config(format!("rollout {} has no canary strategy", rollout.name_any())))?;
        if canary.stable_service.is_empty() || canary.canary_service.is_empty() {
            return Err(RouteError::Config(format!(
                "rollout {} must set both stableService and canaryService",
                rollout.name_any()
            )));
        }
        let cfg = PluginConfig::from_rollout(rollout)?;
        let managed_routes = canary
            .traffic_routing
            .as_ref()
            .map(|tr| {
                tr.managed_routes
                    .iter()
                    .filter(|m| !m.name.trim().is_empty())
                    .map(|m| m.name.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name: rollout.name_any(),
            namespace: rollout.namespace().unwrap_or_default(),
            stable_service: canary.stable_service.clone(),
            canary_service: canary.canary_service.clone(),
            table_selector: cfg.route_table_selector,
            route_selector: cfg.route_selector,
            managed_routes,
        })
    }
}

pub mod prelude {
    pub use super::{fold_eq, RolloutContext, RouteError, RouteResult, PLUGIN_NAME, ROUTER_TYPE};
    pub use super::{DestinationReference, HttpRoute, RouteTable, RouteTableSpec};
}
