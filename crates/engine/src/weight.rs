//! Weight allocation between stable and canary destinations.

use routeshift_core::{DestinationReference, RouteError, RouteResult};
use tracing::debug;

use crate::matcher::MatchedRouteTable;

/// Validate a controller-supplied weight.
pub fn checked_weight(desired: i32) -> RouteResult<u32> {
    u32::try_from(desired)
        .ok()
        .filter(|w| *w <= 100)
        .ok_or_else(|| RouteError::Config(format!("desired weight {} outside 0..=100", desired)))
}

/// Copy of `stable` pointing at the canary service.
pub fn canary_from_stable(stable: &DestinationReference, canary_service: &str) -> DestinationReference {
    let mut dest = stable.clone();
    if let Some(r) = dest.reference.as_mut() {
        r.name = canary_service.to_string();
    }
    dest
}

/// Set stable to `100 - weight` and canary to `weight` on every matched route,
/// appending a canary destination where none exists yet. Re-running with the same
/// weight changes nothing. Returns the number of routes updated.
pub fn allocate_weights(m: &mut MatchedRouteTable, weight: u32, canary_service: &str) -> usize {
    let weight = weight.min(100);
    let mut updated = 0;
    for mr in m.http_routes.iter_mut() {
        let Some(route) = m.table.spec.http.get_mut(mr.route) else { continue };
        let Some(fw) = route.forward_to.as_mut() else { continue };
        let Some(stable) = fw.destinations.get_mut(mr.stable) else { continue };
        stable.weight = 100 - weight;

        let canary_idx = match mr.canary {
            Some(i) if i < fw.destinations.len() => i,
            _ => {
                let mut dest = canary_from_stable(&fw.destinations[mr.stable], canary_service);
                dest.weight = 0;
                fw.destinations.push(dest);
                debug!(route = %route.name, canary = %canary_service, "appended canary destination");
                fw.destinations.len() - 1
            }
        };
        mr.canary = Some(canary_idx);
        fw.destinations[canary_idx].weight = weight;
        updated += 1;
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use crate::matcher::match_routes;

    fn weights(m: &MatchedRouteTable, route: usize) -> Vec<(String, u32)> {
        m.table.spec.http[route]
            .destinations()
            .iter()
            .map(|d| (d.ref_name().unwrap_or_default().to_string(), d.weight))
            .collect()
    }

    #[test]
    fn weight_bounds_are_enforced() {
        assert_eq!(checked_weight(0).unwrap(), 0);
        assert_eq!(checked_weight(100).unwrap(), 100);
        assert!(checked_weight(-1).is_err());
        assert!(checked_weight(101).is_err());
    }

    #[test]
    fn synthesizes_canary_then_reuses_it() {
        let mut m = match_routes(table("rt1", vec![route("r1", vec![dest("svc-s", 100)])]), &rollout()).unwrap();
        assert_eq!(allocate_weights(&mut m, 20, "svc-c"), 1);
        assert_eq!(weights(&m, 0), vec![("svc-s".into(), 80), ("svc-c".into(), 20)]);

        // the synthesized canary keeps the stable port and namespace
        let canary = &m.table.spec.http[0].destinations()[1];
        assert_eq!(canary.port, m.table.spec.http[0].destinations()[0].port);
        assert_eq!(canary.reference.as_ref().unwrap().namespace.as_deref(), Some("apps"));

        // re-matching the mutated table finds the canary; same weight is a no-op
        let snapshot = m.table.clone();
        let mut again = match_routes(m.table.clone(), &rollout()).unwrap();
        allocate_weights(&mut again, 20, "svc-c");
        assert_eq!(again.table, snapshot);

        allocate_weights(&mut again, 50, "svc-c");
        assert_eq!(weights(&again, 0), vec![("svc-s".into(), 50), ("svc-c".into(), 50)]);
    }

    #[test]
    fn weights_always_sum_to_one_hundred() {
        for w in 0..=100u32 {
            let mut m = match_routes(
                table("rt1", vec![route("r1", vec![dest("svc-s", 100)]), route("r2", vec![dest("svc-x", 10), dest("svc-s", 90)])]),
                &rollout(),
            )
            .unwrap();
            allocate_weights(&mut m, w, "svc-c");
            for mr in m.http_routes.iter() {
                let d = m.table.spec.http[mr.route].destinations();
                assert_eq!(d[mr.stable].weight + d[mr.canary.unwrap()].weight, 100, "w={w}");
            }
        }
    }

    #[test]
    fn other_destinations_keep_their_order_and_weight() {
        let mut m = match_routes(table("rt1", vec![route("r1", vec![dest("svc-x", 10), dest("svc-s", 90)])]), &rollout()).unwrap();
        allocate_weights(&mut m, 30, "svc-c");
        assert_eq!(weights(&m, 0), vec![("svc-x".into(), 10), ("svc-s".into(), 70), ("svc-c".into(), 30)]);
    }
}
