//! Gloo Platform `RouteTable` (networking.gloo.solo.io/v2) as seen by the router.
//!
//! Only the parts the engine reads or writes are typed. Everything else is kept in
//! flattened `extra` maps so that serializing a mutated table never drops fields
//! written by other controllers.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub type Extra = BTreeMap<String, Json>;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "networking.gloo.solo.io",
    version = "v2",
    kind = "RouteTable",
    namespaced,
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteTableSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    /// HTTP routes, evaluated in order by the gateway.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRoute>,
    /// TCP routes are carried through untouched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp: Vec<Json>,
    /// TLS routes are carried through untouched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<Json>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRoute {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<HttpRequestMatcher>,
    /// `None` for delegate/redirect/directResponse routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_to: Option<ForwardToAction>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl HttpRoute {
    pub fn destinations(&self) -> &[DestinationReference] {
        self.forward_to.as_ref().map(|f| f.destinations.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForwardToAction {
    #[serde(default)]
    pub destinations: Vec<DestinationReference>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationReference {
    /// Service reference. Virtual destinations and external services carry no `ref`.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub weight: u32,
    #[serde(flatten)]
    pub extra: Extra,
}

impl DestinationReference {
    pub fn ref_name(&self) -> Option<&str> {
        self.reference.as_ref().map(|r| r.name.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// All header predicates must hold for the matcher to apply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatcher>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatcher {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub regex: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub invert_match: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Json {
        serde_json::json!({
            "apiVersion": "networking.gloo.solo.io/v2",
            "kind": "RouteTable",
            "metadata": { "name": "rt1", "namespace": "apps", "labels": { "team": "web" } },
            "spec": {
                "hosts": ["www.example.com"],
                "virtualGateways": [{ "name": "north-south", "namespace": "gloo" }],
                "http": [{
                    "name": "r1",
                    "matchers": [{ "uri": { "prefix": "/api" } }],
                    "options": { "retries": { "attempts": 3 } },
                    "forwardTo": {
                        "pathRewrite": "/",
                        "destinations": [{
                            "ref": { "name": "svc-s", "namespace": "apps" },
                            "port": { "number": 8080 },
                            "kind": "SERVICE",
                            "weight": 100
                        }]
                    }
                }, {
                    "name": "delegated",
                    "delegate": { "routeTables": [{ "labels": { "x": "y" } }] }
                }],
                "tcp": [{ "forwardTo": { "destinations": [] } }]
            }
        })
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = sample();
        let rt: RouteTable = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(rt.spec.http.len(), 2);
        assert!(rt.spec.http[1].forward_to.is_none());
        assert_eq!(rt.spec.http[0].destinations()[0].ref_name(), Some("svc-s"));
        assert!(rt.spec.extra.contains_key("virtualGateways"));

        let back = serde_json::to_value(&rt).unwrap();
        assert_eq!(back["spec"], raw["spec"]);
    }

    #[test]
    fn header_matcher_omits_false_flags() {
        let hm = HeaderMatcher { name: "x-canary".into(), value: Some("true".into()), regex: false, invert_match: false };
        assert_eq!(serde_json::to_value(&hm).unwrap(), serde_json::json!({ "name": "x-canary", "value": "true" }));
    }
}
