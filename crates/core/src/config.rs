//! Plugin configuration blob stored under `trafficRouting.plugins["solo-io/glooplatform"]`.

use std::collections::BTreeMap;

use kube::ResourceExt;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Rollout, RouteError, RouteResult, PLUGIN_NAME};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    #[serde(default)]
    pub route_table_selector: Option<SimpleObjectSelector>,
    #[serde(default)]
    pub route_selector: Option<SimpleRouteSelector>,
}

/// Table-level selector. `name` wins over `labels` when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleObjectSelector {
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub namespace: String,
}

/// Route-level pre-filter applied before destination matching.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimpleRouteSelector {
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
}

// `"labels": null` is common in hand-written rollouts.
fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

impl PluginConfig {
    pub fn from_json(raw: &serde_json::Value) -> RouteResult<Self> {
        serde_json::from_value(raw.clone())
            .map_err(|e| RouteError::Config(format!("invalid {} plugin config: {}", PLUGIN_NAME, e)))
    }

    pub fn from_rollout(rollout: &Rollout) -> RouteResult<Self> {
        let raw = rollout
            .spec
            .strategy
            .canary
            .as_ref()
            .and_then(|c| c.traffic_routing.as_ref())
            .and_then(|tr| tr.plugins.get(PLUGIN_NAME))
            .ok_or_else(|| {
                RouteError::Config(format!(
                    "rollout {} has no trafficRouting.plugins[\"{}\"] entry",
                    rollout.name_any(),
                    PLUGIN_NAME
                ))
            })?;
        Self::from_json(raw)
    }
}
