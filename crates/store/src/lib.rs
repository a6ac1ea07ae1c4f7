//! Routeshift store: the route-table capability the engine talks to, the per-call
//! context (deadline + cancellation), and an in-RAM implementation.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use kube::ResourceExt;
use routeshift_core::{RouteError, RouteResult, RouteTable};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backing store for route tables (get/list/patch).
#[async_trait::async_trait]
pub trait RouteStore: Send + Sync {
    /// Fetch exactly one table. Missing tables are errors.
    async fn get(&self, namespace: &str, name: &str) -> Result<RouteTable>;

    /// List tables, optionally scoped to a namespace, keeping those whose labels
    /// contain every given key/value pair.
    async fn list(&self, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<RouteTable>>;

    /// Persist the difference between `original` and `mutated` as a merge patch.
    async fn patch(&self, mutated: &RouteTable, original: &RouteTable) -> Result<()>;
}

fn store_timeout() -> Option<Duration> {
    let secs = std::env::var("ROUTESHIFT_STORE_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Deadline and cancellation applied to every store call of one operation.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl OpContext {
    pub fn new(deadline: Option<Duration>) -> Self {
        Self { deadline, cancel: CancellationToken::new() }
    }

    /// Deadline from `ROUTESHIFT_STORE_TIMEOUT_SECS` (default 30, `0` disables).
    pub fn from_env() -> Self { Self::new(store_timeout()) }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one store call; store failures become `Store`, deadline/cancel become `Cancelled`.
    pub async fn run<T, F>(&self, what: &str, fut: F) -> RouteResult<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(RouteError::Cancelled(format!("{what}: operation cancelled")));
        }
        let guarded = async {
            let res = match self.deadline {
                Some(d) => match tokio::time::timeout(d, fut).await {
                    Ok(r) => r,
                    Err(_) => return Err(RouteError::Cancelled(format!("{what}: deadline of {:?} exceeded", d))),
                },
                None => fut.await,
            };
            res.map_err(|e| RouteError::Store(format!("{what}: {e:#}")))
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RouteError::Cancelled(format!("{what}: operation cancelled"))),
            r = guarded => r,
        }
    }
}

/// Store call counters, used to assert which calls an operation made.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub gets: AtomicU64,
    pub lists: AtomicU64,
    pub patches: AtomicU64,
}

impl CallCounts {
    pub fn reads(&self) -> u64 { self.gets.load(Ordering::Relaxed) + self.lists.load(Ordering::Relaxed) }
    pub fn patches(&self) -> u64 { self.patches.load(Ordering::Relaxed) }
}

type Key = (String, String);

fn key_of(rt: &RouteTable) -> Key { (rt.namespace().unwrap_or_default(), rt.name_any()) }

/// In-RAM route store. Backs dry runs and tests; patches go through the same
/// merge-patch path the cluster store uses.
#[derive(Default)]
pub struct MemoryStore {
    tables: ArcSwap<BTreeMap<Key, RouteTable>>,
    failing: ArcSwap<BTreeSet<Key>>,
    pub calls: CallCounts,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_tables(tables: impl IntoIterator<Item = RouteTable>) -> Self {
        let s = Self::new();
        for t in tables { s.insert(t); }
        s
    }

    pub fn insert(&self, table: RouteTable) {
        let key = key_of(&table);
        self.tables.rcu(|cur| {
            let mut next = BTreeMap::clone(cur);
            next.insert(key.clone(), table.clone());
            next
        });
    }

    /// Current stored copy of a table.
    pub fn table(&self, namespace: &str, name: &str) -> Option<RouteTable> {
        self.tables.load().get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn tables(&self) -> Vec<RouteTable> { self.tables.load().values().cloned().collect() }

    /// Make every patch of the given table fail.
    pub fn fail_patches_for(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        self.failing.rcu(|cur| {
            let mut next = BTreeSet::clone(cur);
            next.insert(key.clone());
            next
        });
    }
}

#[async_trait::async_trait]
impl RouteStore for MemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<RouteTable> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        self.table(namespace, name)
            .ok_or_else(|| anyhow!("routetables.networking.gloo.solo.io \"{}\" not found in namespace {}", name, namespace))
    }

    async fn list(&self, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<RouteTable>> {
        self.calls.lists.fetch_add(1, Ordering::Relaxed);
        let out: Vec<RouteTable> = self
            .tables
            .load()
            .iter()
            .filter(|((ns, _), _)| namespace.map(|n| n == ns.as_str()).unwrap_or(true))
            .filter(|(_, rt)| labels.iter().all(|(k, v)| rt.labels().get(k) == Some(v)))
            .map(|(_, rt)| rt.clone())
            .collect();
        debug!(ns = ?namespace, labels = ?labels, count = out.len(), "memory store list");
        Ok(out)
    }

    async fn patch(&self, mutated: &RouteTable, original: &RouteTable) -> Result<()> {
        self.calls.patches.fetch_add(1, Ordering::Relaxed);
        let key = key_of(mutated);
        if self.failing.load().contains(&key) {
            return Err(anyhow!("injected patch failure for {}/{}", key.0, key.1));
        }
        let patch = routeshift_apply::table_patch(original, mutated)?;
        // The patch is applied against the table current at swap time; a lost race
        // reruns the closure on the newer map.
        let mut outcome: Result<()> = Ok(());
        self.tables.rcu(|cur| {
            let mut next = BTreeMap::clone(cur);
            outcome = apply_table_patch(cur.get(&key), &key, &patch).map(|rt| {
                next.insert(key.clone(), rt);
            });
            next
        });
        outcome
    }
}

fn apply_table_patch(current: Option<&RouteTable>, key: &Key, patch: &serde_json::Value) -> Result<RouteTable> {
    let current = current
        .ok_or_else(|| anyhow!("routetables.networking.gloo.solo.io \"{}\" not found in namespace {}", key.1, key.0))?;
    let mut live = serde_json::to_value(current).context("serializing stored RouteTable")?;
    routeshift_apply::apply_merge_patch(&mut live, patch);
    let mut next: RouteTable = serde_json::from_value(live).context("decoding patched RouteTable")?;
    let rv = current.metadata.resource_version.as_deref().and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    next.metadata.resource_version = Some((rv + 1).to_string());
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use routeshift_core::RouteTableSpec;
    use std::sync::Arc;

    fn table(ns: &str, name: &str, labels: &[(&str, &str)]) -> RouteTable {
        let mut rt = RouteTable::new(name, RouteTableSpec::default());
        rt.metadata.namespace = Some(ns.to_string());
        rt.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        rt
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = MemoryStore::with_tables([
            table("apps", "a", &[("team", "web"), ("tier", "edge")]),
            table("apps", "b", &[("team", "api")]),
            table("other", "c", &[("team", "web")]),
        ]);
        let web: BTreeMap<String, String> = [("team".to_string(), "web".to_string())].into();
        let names = |v: Vec<RouteTable>| v.into_iter().map(|t| t.name_any()).collect::<Vec<_>>();

        assert_eq!(names(store.list(Some("apps"), &web).await.unwrap()), vec!["a"]);
        assert_eq!(names(store.list(None, &web).await.unwrap()), vec!["a", "c"]);
        assert_eq!(names(store.list(Some("apps"), &BTreeMap::new()).await.unwrap()), vec!["a", "b"]);
        assert_eq!(store.calls.reads(), 3);
    }

    #[tokio::test]
    async fn patch_applies_difference_and_bumps_version() {
        let original = table("apps", "a", &[]);
        let store = MemoryStore::with_tables([original.clone()]);
        let mut mutated = original.clone();
        mutated.spec.hosts.push("www.example.com".into());

        store.patch(&mutated, &original).await.unwrap();
        let stored = store.table("apps", "a").unwrap();
        assert_eq!(stored.spec.hosts, vec!["www.example.com"]);
        assert_eq!(stored.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(store.calls.patches(), 1);
    }

    #[test]
    fn concurrent_inserts_are_all_kept() {
        let store = MemoryStore::new();
        std::thread::scope(|s| {
            for t in 0..8 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..200 {
                        store.insert(table("apps", &format!("rt-{t}-{i}"), &[]));
                    }
                });
            }
        });
        assert_eq!(store.tables().len(), 1600);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_patches_do_not_drop_each_other() {
        let originals: Vec<RouteTable> = (0..64).map(|i| table("apps", &format!("rt-{i}"), &[])).collect();
        let store = Arc::new(MemoryStore::with_tables(originals.clone()));
        let mut tasks = Vec::new();
        for original in originals {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut mutated = original.clone();
                mutated.spec.hosts.push(format!("{}.example.com", original.name_any()));
                store.patch(&mutated, &original).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let tables = store.tables();
        assert_eq!(tables.len(), 64);
        assert!(tables.iter().all(|t| t.spec.hosts == vec![format!("{}.example.com", t.name_any())]));
        assert!(tables.iter().all(|t| t.metadata.resource_version.as_deref() == Some("1")));
    }

    #[tokio::test]
    async fn missing_table_is_an_error() {
        let store = MemoryStore::new();
        let err = store.get("apps", "nope").await.unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[tokio::test]
    async fn context_maps_failures_and_cancellation() {
        let ctx = OpContext::new(Some(Duration::from_millis(20)));
        let err = ctx.run("get apps/a", async { Err::<(), _>(anyhow!("boom")) }).await.unwrap_err();
        assert_eq!(err, RouteError::Store("get apps/a: boom".into()));

        let slow = ctx
            .run("list apps", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(slow, RouteError::Cancelled(_)), "{slow}");

        let cancelled = OpContext::new(None);
        cancelled.cancel.cancel();
        let err = cancelled.run("patch apps/a", async { Ok(1) }).await.unwrap_err();
        assert!(matches!(err, RouteError::Cancelled(_)));
    }
}
