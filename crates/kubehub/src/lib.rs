//! Routeshift kubehub: kube-rs wiring for RouteTables and Rollouts.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use metrics::counter;
use routeshift_core::{Rollout, RouteTable};
use routeshift_store::RouteStore;
use tokio::sync::OnceCell;
use tracing::{debug, info};

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Shared kube client built from the ambient kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async { Client::try_default().await.context("building kube client") })
        .await?;
    Ok(client.clone())
}

/// Render `k=v` pairs as a label selector string (`a=1,b=2`).
pub fn label_selector(labels: &BTreeMap<String, String>) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    Some(labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
}

/// Fetch a rollout by namespace/name.
pub async fn fetch_rollout(namespace: &str, name: &str) -> Result<Rollout> {
    let client = get_kube_client().await?;
    let api: Api<Rollout> = Api::namespaced(client, namespace);
    api.get(name).await.with_context(|| format!("getting Rollout {}/{}", namespace, name))
}

/// Route store backed by the cluster API (`networking.gloo.solo.io/v2` RouteTables).
#[derive(Clone)]
pub struct KubeRouteStore {
    client: Client,
    field_manager: String,
}

impl KubeRouteStore {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: "routeshift".to_string() }
    }

    pub async fn try_default() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    pub fn with_field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = manager.into();
        self
    }

    fn api(&self, namespace: Option<&str>) -> Api<RouteTable> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl RouteStore for KubeRouteStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<RouteTable> {
        let rt = self
            .api(Some(namespace))
            .get(name)
            .await
            .with_context(|| format!("getting RouteTable {}/{}", namespace, name))?;
        debug!(ns = %namespace, name = %name, rv = ?rt.resource_version(), "fetched route table");
        Ok(rt)
    }

    async fn list(&self, namespace: Option<&str>, labels: &BTreeMap<String, String>) -> Result<Vec<RouteTable>> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector(labels) {
            lp = lp.labels(&sel);
        }
        let list = self
            .api(namespace)
            .list(&lp)
            .await
            .with_context(|| format!("listing RouteTables (ns={:?}, selector={:?})", namespace, lp.label_selector))?;
        debug!(ns = ?namespace, count = list.items.len(), "listed route tables");
        Ok(list.items)
    }

    async fn patch(&self, mutated: &RouteTable, original: &RouteTable) -> Result<()> {
        let namespace = mutated.namespace().ok_or_else(|| anyhow!("RouteTable {} has no namespace", mutated.name_any()))?;
        let name = mutated.name_any();
        let patch = routeshift_apply::table_patch(original, mutated)?;
        if routeshift_apply::is_empty_patch(&patch) {
            debug!(ns = %namespace, name = %name, "empty patch; skipping");
            return Ok(());
        }
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        match self.api(Some(&namespace)).patch(&name, &pp, &Patch::Merge(&patch)).await {
            Ok(obj) => {
                counter!("routeshift_kube_patch_ok", 1u64);
                info!(ns = %namespace, name = %name, rv = ?obj.resource_version(), "RouteTable patched");
                Ok(())
            }
            Err(e) => {
                counter!("routeshift_kube_patch_err", 1u64);
                Err(anyhow!("failed to patch RouteTable {}/{}: {}", namespace, name, e))
            }
        }
    }
}
