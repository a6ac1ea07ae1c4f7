//! Candidate route-table resolution from the plugin's `routeTableSelector`.

use routeshift_core::{RolloutContext, RouteError, RouteResult, RouteTable};
use routeshift_store::{OpContext, RouteStore};
use tracing::debug;

/// Resolve candidate tables. An exact name fetches one table (labels are ignored);
/// otherwise tables are listed by label. The namespace defaults to the rollout's.
/// An empty result is not an error here.
pub async fn select_route_tables(
    store: &dyn RouteStore,
    ctx: &OpContext,
    rollout: &RolloutContext,
) -> RouteResult<Vec<RouteTable>> {
    let sel = rollout
        .table_selector
        .as_ref()
        .ok_or_else(|| RouteError::Config("routeTable selector is required".into()))?;
    let namespace = if sel.namespace.is_empty() {
        debug!(rollout = %rollout.name, ns = %rollout.namespace, "defaulting routeTableSelector namespace to rollout namespace");
        rollout.namespace.as_str()
    } else {
        sel.namespace.as_str()
    };

    if !sel.name.is_empty() {
        let what = format!("get RouteTable {}/{}", namespace, sel.name);
        let rt = ctx.run(&what, store.get(namespace, &sel.name)).await?;
        debug!(ns = %namespace, name = %sel.name, "selected route table by name");
        return Ok(vec![rt]);
    }

    let ns = (!namespace.is_empty()).then_some(namespace);
    let what = format!("list RouteTables ns={} labels={:?}", namespace, sel.labels);
    let tables = ctx.run(&what, store.list(ns, &sel.labels)).await?;
    debug!(ns = ?ns, labels = ?sel.labels, count = tables.len(), "selected route tables by labels");
    Ok(tables)
}
