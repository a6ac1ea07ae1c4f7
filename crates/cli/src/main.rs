use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use kube::ResourceExt;
use routeshift_core::{HeaderRoutingMatch, Rollout, RouteTable, SetHeaderRoute, StringMatch};
use routeshift_engine::{MemoryStore, OpContext, OpReport, RouteStore, TableState, TrafficRouter};
use routeshift_kubehub::KubeRouteStore;
use serde::Deserialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "routeshiftctl", version, about = "Shift rollout traffic across Gloo Platform RouteTables")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Compute changes without patching
    #[arg(long = "dry-run", global = true, action = ArgAction::SetTrue)]
    dry_run: bool,

    #[command(flatten)]
    source: Source,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Source {
    /// Rollout manifest (YAML)
    #[arg(long = "file", global = true, conflicts_with = "rollout")]
    file: Option<std::path::PathBuf>,

    /// Rollout name to fetch from the cluster
    #[arg(long = "rollout", global = true)]
    rollout: Option<String>,

    /// Namespace of the rollout
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Seed an in-memory store from a multi-document RouteTable YAML instead of the cluster
    #[arg(long = "tables", global = true)]
    tables: Option<std::path::PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a percentage of traffic to the canary
    SetWeight {
        /// Canary weight (0..=100)
        weight: i32,
    },
    /// Route requests matching header rules straight to the canary
    SetHeaderRoute {
        /// Header route name
        #[arg(long = "name")]
        name: String,
        /// Rule as name=exact:value, name=regex:value or name=prefix:value (repeatable; none removes the route)
        #[arg(long = "match", value_parser = parse_match)]
        matches: Vec<HeaderRoutingMatch>,
    },
    /// Remove the header routes listed under managedRoutes
    RemoveManagedRoutes,
    /// Report whether the current weight is in effect
    Verify {
        /// Expected canary weight
        weight: i32,
    },
}

fn init_tracing() {
    let env = std::env::var("ROUTESHIFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ROUTESHIFT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ROUTESHIFT_METRICS_ADDR; expected host:port");
        }
    }
}

/// `x-canary=exact:true` style header rule.
fn parse_match(s: &str) -> Result<HeaderRoutingMatch, String> {
    let (header, rule) = s.split_once('=').ok_or_else(|| format!("expected name=kind:value, got {:?}", s))?;
    let (kind, value) = rule.split_once(':').ok_or_else(|| format!("expected kind:value after '=', got {:?}", rule))?;
    if header.is_empty() {
        return Err("header name must not be empty".into());
    }
    let header_value = match kind {
        "exact" => StringMatch::exact(value),
        "regex" => StringMatch::regex(value),
        "prefix" => StringMatch::prefix(value),
        other => return Err(format!("unknown match kind {:?} (exact|regex|prefix)", other)),
    };
    Ok(HeaderRoutingMatch { header_name: header.to_string(), header_value })
}

fn parse_tables(raw: &str) -> Result<Vec<RouteTable>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(raw).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i))?;
        if value.is_null() {
            continue;
        }
        let rt: RouteTable = serde_yaml::from_value(value).with_context(|| format!("decoding RouteTable in document {}", i))?;
        out.push(rt);
    }
    Ok(out)
}

async fn load_rollout(src: &Source) -> Result<Rollout> {
    if let Some(path) = &src.file {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut ro: Rollout = serde_yaml::from_str(&raw).with_context(|| format!("decoding Rollout from {}", path.display()))?;
        if ro.metadata.namespace.is_none() {
            ro.metadata.namespace = Some(src.namespace.clone().unwrap_or_else(|| "default".to_string()));
        }
        return Ok(ro);
    }
    let Some(name) = &src.rollout else { bail!("either --file or --rollout is required") };
    let ns = src.namespace.as_deref().unwrap_or("default");
    routeshift_kubehub::fetch_rollout(ns, name).await
}

/// Cluster-backed store, or a seeded in-memory one when `--tables` is given.
async fn build_store(src: &Source) -> Result<(Arc<dyn RouteStore>, bool)> {
    match &src.tables {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let tables = parse_tables(&raw)?;
            info!(count = tables.len(), path = %path.display(), "seeded in-memory route tables");
            Ok((Arc::new(MemoryStore::with_tables(tables)), true))
        }
        None => Ok((Arc::new(KubeRouteStore::try_default().await?.with_field_manager("routeshiftctl")), false)),
    }
}

fn print_report(report: &OpReport, output: Output, show_tables: bool) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<22} {:<40} {:<10} CHANGES", "OP", "ROUTETABLE", "STATE");
            for t in report.tables.iter() {
                let state = match t.state {
                    TableState::Patched => "patched",
                    TableState::DryRun => "dry-run",
                    TableState::Unchanged => "unchanged",
                    TableState::Failed => "failed",
                };
                println!("{:<22} {:<40} {:<10} +{} ~{} -{}", report.op, t.key, state, t.summary.adds, t.summary.updates, t.summary.removes);
            }
            if show_tables {
                for t in report.tables.iter().filter(|t| t.state != TableState::Unchanged) {
                    println!("---\n{}", serde_yaml::to_string(&t.table)?.trim_end());
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let rollout = load_rollout(&cli.source).await?;
    info!(rollout = %rollout.name_any(), ns = ?rollout.namespace(), dry_run = cli.dry_run, "rollout loaded");
    let (store, in_memory) = build_store(&cli.source).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; cancelling in-flight store calls");
                cancel.cancel();
            }
        }
    });
    let router = TrafficRouter::new(store)
        .dry_run(cli.dry_run)
        .with_context(OpContext::from_env().with_cancel(cancel));
    let show_tables = cli.dry_run || in_memory;

    let report = match cli.command {
        Commands::SetWeight { weight } => router.set_weight(&rollout, weight, &[]).await?,
        Commands::SetHeaderRoute { name, matches } => {
            router.set_header_route(&rollout, &SetHeaderRoute { name, matches }).await?
        }
        Commands::RemoveManagedRoutes => router.remove_managed_routes(&rollout).await?,
        Commands::Verify { weight } => {
            let verified = router.verify_weight(&rollout, weight, &[]).await?;
            match cli.output {
                Output::Human => println!("{} weight {} verified: {}", router.type_name(), weight, verified),
                Output::Json => println!("{}", serde_json::json!({ "router": router.type_name(), "weight": weight, "verified": verified })),
            }
            return Ok(());
        }
    };
    print_report(&report, cli.output, show_tables)?;
    if report.changed() == 0 {
        info!(op = report.op, "no route tables changed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_rules_parse_each_kind() {
        let m = parse_match("x-canary=exact:true").unwrap();
        assert_eq!(m.header_name, "x-canary");
        assert_eq!(m.header_value, StringMatch::exact("true"));
        assert_eq!(parse_match("x-user=regex:^(a|b):1$").unwrap().header_value, StringMatch::regex("^(a|b):1$"));
        assert_eq!(parse_match("x-v=prefix:v2").unwrap().header_value, StringMatch::prefix("v2"));
    }

    #[test]
    fn malformed_match_rules_are_rejected() {
        assert!(parse_match("x-canary").is_err());
        assert!(parse_match("x-canary=true").is_err());
        assert!(parse_match("=exact:true").is_err());
        assert!(parse_match("x=glob:*").is_err());
    }

    #[test]
    fn tables_yaml_skips_empty_documents() {
        let raw = r#"
apiVersion: networking.gloo.solo.io/v2
kind: RouteTable
metadata: { name: rt1, namespace: apps }
spec:
  hosts: [www.example.com]
  http:
    - name: r1
      forwardTo:
        destinations:
          - ref: { name: svc-s, namespace: apps }
            port: { number: 8080 }
            weight: 100
---
---
apiVersion: networking.gloo.solo.io/v2
kind: RouteTable
metadata: { name: rt2, namespace: apps }
spec: {}
"#;
        let tables = parse_tables(raw).unwrap();
        assert_eq!(tables.iter().map(|t| t.name_any()).collect::<Vec<_>>(), vec!["rt1", "rt2"]);
        assert_eq!(tables[0].spec.http[0].destinations()[0].weight, 100);
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "routeshiftctl", "set-header-route", "--name", "hr1", "--match", "x-canary=exact:true", "--file", "ro.yaml", "--dry-run",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert!(cli.source.file.is_some());
        match cli.command {
            Commands::SetHeaderRoute { name, matches } => {
                assert_eq!(name, "hr1");
                assert_eq!(matches.len(), 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
