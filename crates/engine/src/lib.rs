//! Routeshift engine: computes how traffic is redistributed across Gloo Platform
//! RouteTables during a progressive rollout and applies the minimal patches.
//!
//! Flow per operation: select candidate tables, match routes to the rollout's
//! stable/canary services, mutate (weights, header routes, reaping), then patch
//! each table against its pre-mutation snapshot. Tables are processed one at a
//! time; a failing table is recorded and the rest still run.

#![forbid(unsafe_code)]

pub mod header;
pub mod matcher;
pub mod reaper;
pub mod router;
pub mod select;
pub mod weight;

pub use matcher::{match_routes, match_tables, MatchedHttpRoute, MatchedRouteTable};
pub use router::{OpReport, TableOutcome, TableState, TrafficRouter};
pub use routeshift_store::{MemoryStore, OpContext, RouteStore};
