//! `TrafficRouter`: the operations a rollout controller invokes on every
//! reconciliation, run against any [`RouteStore`].

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use routeshift_apply::DiffSummary;
use routeshift_core::{
    Rollout, RolloutContext, RouteError, RouteResult, RouteTable, SetHeaderRoute, WeightDestination, ROUTER_TYPE,
};
use routeshift_store::{OpContext, RouteStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::header::{build_header_matcher, synthesize_header_routes};
use crate::matcher::{match_tables, table_key, MatchedRouteTable};
use crate::reaper::reap_managed_routes;
use crate::select::select_route_tables;
use crate::weight::{allocate_weights, checked_weight};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    /// Patch accepted by the store.
    Patched,
    /// Mutated in memory only.
    DryRun,
    /// Nothing to change.
    Unchanged,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub key: String,
    pub state: TableState,
    pub summary: DiffSummary,
    /// Table as mutated by the operation.
    pub table: RouteTable,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OpReport {
    pub op: &'static str,
    pub tables: Vec<TableOutcome>,
}

impl OpReport {
    fn new(op: &'static str) -> Self { Self { op, tables: Vec::new() } }

    pub fn changed(&self) -> usize {
        self.tables.iter().filter(|t| matches!(t.state, TableState::Patched | TableState::DryRun)).count()
    }
}

pub struct TrafficRouter {
    store: Arc<dyn RouteStore>,
    ctx: OpContext,
    dry_run: bool,
}

impl TrafficRouter {
    pub fn new(store: Arc<dyn RouteStore>) -> Self {
        Self { store, ctx: OpContext::from_env(), dry_run: false }
    }

    /// Compute mutations without patching the store.
    pub fn dry_run(mut self, on: bool) -> Self {
        self.dry_run = on;
        self
    }

    pub fn with_context(mut self, ctx: OpContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn type_name(&self) -> &'static str { ROUTER_TYPE }

    /// Shift `desired_weight` percent of traffic to the canary on every matched route.
    pub async fn set_weight(
        &self,
        rollout: &Rollout,
        desired_weight: i32,
        additional_destinations: &[WeightDestination],
    ) -> RouteResult<OpReport> {
        let t0 = Instant::now();
        let mut report = OpReport::new("set_weight");
        let weight = checked_weight(desired_weight)?;
        if rollout.spec.strategy.canary.is_none() && rollout.spec.strategy.blue_green.is_some() {
            info!("blue-green rollout; weight routing not applicable");
            return Ok(report);
        }
        let ro = RolloutContext::from_rollout(rollout)?;
        if !additional_destinations.is_empty() {
            debug!(count = additional_destinations.len(), "additional weighted destinations are not routed by this plugin");
        }
        info!(rollout = %ro.name, ns = %ro.namespace, weight, "set weight");

        let tables = select_route_tables(self.store.as_ref(), &self.ctx, &ro).await?;
        let (matched, mut errors) = match_tables(tables, &ro);
        for mut m in matched {
            let original = m.table.clone();
            let routes = allocate_weights(&mut m, weight, &ro.canary_service);
            debug!(table = %m.key(), routes, "weights allocated");
            self.commit(&original, m, &mut report, &mut errors).await;
        }
        self.finish(report, errors, t0)
    }

    /// Install (or replace) a header route sending matching requests to the canary.
    /// A header route without match rules removes any route of that name.
    pub async fn set_header_route(&self, rollout: &Rollout, header_route: &SetHeaderRoute) -> RouteResult<OpReport> {
        let t0 = Instant::now();
        let mut report = OpReport::new("set_header_route");
        if header_route.name.trim().is_empty() {
            return Err(RouteError::Config("header route name must not be empty".into()));
        }
        let ro = RolloutContext::from_rollout(rollout)?;
        let matcher = if header_route.matches.is_empty() {
            None
        } else {
            Some(build_header_matcher(&header_route.name, &header_route.matches)?)
        };
        info!(rollout = %ro.name, ns = %ro.namespace, route = %header_route.name, rules = header_route.matches.len(), "set header route");

        let tables = select_route_tables(self.store.as_ref(), &self.ctx, &ro).await?;
        if tables.is_empty() {
            return Err(RouteError::Selector(format!(
                "unable to find qualifying RouteTables for rollout {}/{}",
                ro.namespace, ro.name
            )));
        }
        let (matched, mut errors) = match_tables(tables, &ro);
        for mut m in matched {
            let original = m.table.clone();
            match &matcher {
                Some(matcher) => {
                    synthesize_header_routes(&mut m, matcher, &header_route.name, &ro.canary_service);
                }
                None => {
                    let removed = reap_managed_routes(&mut m.table, std::slice::from_ref(&header_route.name));
                    debug!(table = %m.key(), removed = removed.len(), "header route cleared");
                }
            }
            self.commit(&original, m, &mut report, &mut errors).await;
        }
        self.finish(report, errors, t0)
    }

    /// Remove every header route listed under `trafficRouting.managedRoutes`.
    /// Rollouts without header-route steps are a no-op and never touch the store.
    pub async fn remove_managed_routes(&self, rollout: &Rollout) -> RouteResult<OpReport> {
        let t0 = Instant::now();
        let mut report = OpReport::new("remove_managed_routes");
        let has_header_steps = rollout
            .spec
            .strategy
            .canary
            .as_ref()
            .map(|c| c.steps.iter().any(|s| s.set_header_route.is_some()))
            .unwrap_or(false);
        if !has_header_steps {
            debug!("no setHeaderRoute steps; nothing to clean up");
            return Ok(report);
        }
        let ro = RolloutContext::from_rollout(rollout)?;
        info!(rollout = %ro.name, ns = %ro.namespace, managed = ?ro.managed_routes, "remove managed routes");

        let tables = select_route_tables(self.store.as_ref(), &self.ctx, &ro).await?;
        let (matched, mut errors) = match_tables(tables, &ro);
        for mut m in matched {
            let original = m.table.clone();
            let removed = reap_managed_routes(&mut m.table, &ro.managed_routes);
            debug!(table = %m.key(), removed = ?removed, "managed routes reaped");
            self.commit(&original, m, &mut report, &mut errors).await;
        }
        self.finish(report, errors, t0)
    }

    /// Patches are applied synchronously by the store, so a successful
    /// `set_weight` is already in effect.
    pub async fn verify_weight(
        &self,
        _rollout: &Rollout,
        _desired_weight: i32,
        _additional_destinations: &[WeightDestination],
    ) -> RouteResult<bool> {
        Ok(true)
    }

    /// Route tables reference services, not pod hashes; nothing to do.
    pub async fn update_hash(
        &self,
        _rollout: &Rollout,
        _canary_hash: &str,
        _stable_hash: &str,
        _additional_destinations: &[WeightDestination],
    ) -> RouteResult<()> {
        Ok(())
    }

    /// Mirroring is not supported by this router; accepted as a no-op.
    pub async fn set_mirror_route(&self, _rollout: &Rollout, _mirror_route: &serde_json::Value) -> RouteResult<()> {
        Ok(())
    }

    async fn commit(
        &self,
        original: &RouteTable,
        m: MatchedRouteTable,
        report: &mut OpReport,
        errors: &mut Vec<RouteError>,
    ) {
        let key = table_key(&m.table);
        let summary = match routeshift_apply::table_diff(original, &m.table) {
            Ok(s) => s,
            Err(e) => {
                errors.push(RouteError::Store(format!("diff RouteTable {}: {:#}", key, e)));
                report.tables.push(TableOutcome { key, state: TableState::Failed, summary: DiffSummary::default(), table: m.table });
                return;
            }
        };
        let state = if summary.is_empty() {
            debug!(table = %key, "no changes");
            TableState::Unchanged
        } else if self.dry_run {
            debug!(table = %key, ?summary, "dry run; patch skipped");
            TableState::DryRun
        } else {
            let what = format!("patch RouteTable {}", key);
            match self.ctx.run(&what, self.store.patch(&m.table, original)).await {
                Ok(()) => {
                    counter!("routeshift_patch_ok", 1u64);
                    info!(table = %key, adds = summary.adds, updates = summary.updates, removes = summary.removes, "patched route table");
                    TableState::Patched
                }
                Err(e) => {
                    counter!("routeshift_patch_err", 1u64);
                    warn!(table = %key, error = %e, "patch failed; continuing with remaining tables");
                    errors.push(e);
                    TableState::Failed
                }
            }
        };
        report.tables.push(TableOutcome { key, state, summary, table: m.table });
    }

    fn finish(&self, report: OpReport, errors: Vec<RouteError>, t0: Instant) -> RouteResult<OpReport> {
        counter!("routeshift_ops_total", 1u64, "op" => report.op);
        histogram!("routeshift_op_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => report.op);
        info!(op = report.op, tables = report.tables.len(), changed = report.changed(), errors = errors.len(), took_ms = %t0.elapsed().as_millis(), "operation done");
        RouteError::combine(errors)?;
        Ok(report)
    }
}
