//! Routeshift apply: JSON merge patches (RFC 7386) between an original and a mutated
//! route table, plus a small diff summary for logs and dry-run output.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use routeshift_core::RouteTable;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Server-populated fields that never belong in a patch.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

/// Merge patch turning `original` into `mutated`. Identical inputs give `{}`.
///
/// Objects are diffed key by key (removed keys become `null`); arrays and scalars
/// are replaced whole, as merge-patch has no array semantics.
pub fn merge_patch(original: &Json, mutated: &Json) -> Json {
    match (original, mutated) {
        (Json::Object(oo), Json::Object(mo)) => {
            let mut out = Map::new();
            for (k, mv) in mo.iter() {
                match oo.get(k) {
                    Some(ov) if ov == mv => {}
                    Some(ov @ Json::Object(_)) if mv.is_object() => {
                        out.insert(k.clone(), merge_patch(ov, mv));
                    }
                    _ => { out.insert(k.clone(), mv.clone()); }
                }
            }
            for k in oo.keys() {
                if !mo.contains_key(k) { out.insert(k.clone(), Json::Null); }
            }
            Json::Object(out)
        }
        (_, mv) => mv.clone(),
    }
}

/// Apply a merge patch in place (the store side of [`merge_patch`]).
pub fn apply_merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(po) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() { *target = Json::Object(Map::new()); }
    if let Json::Object(to) = target {
        for (k, pv) in po.iter() {
            if pv.is_null() {
                to.remove(k);
            } else {
                apply_merge_patch(to.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}

pub fn is_empty_patch(patch: &Json) -> bool {
    patch.as_object().map(|o| o.is_empty()).unwrap_or(false)
}

/// Merge patch for a route table pair, ignoring server-populated metadata.
pub fn table_patch(original: &RouteTable, mutated: &RouteTable) -> Result<Json> {
    let o = strip_noisy(serde_json::to_value(original).context("serializing original RouteTable")?);
    let m = strip_noisy(serde_json::to_value(mutated).context("serializing mutated RouteTable")?);
    Ok(merge_patch(&o, &m))
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { walk(&aa[i], &bb[i], adds, ups, rems); } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}

/// Diff summary for a route table pair (mutated against original).
pub fn table_diff(original: &RouteTable, mutated: &RouteTable) -> Result<DiffSummary> {
    let o = strip_noisy(serde_json::to_value(original).context("serializing original RouteTable")?);
    let m = strip_noisy(serde_json::to_value(mutated).context("serializing mutated RouteTable")?);
    Ok(diff_summary(&m, &o))
}
