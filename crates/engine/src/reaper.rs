//! Removal of header routes the rollout manages.

use routeshift_core::{fold_eq, RouteTable};

/// Drop every HTTP route whose name matches one of `managed` (case-insensitive),
/// keeping the remaining routes in order. Empty names never match, so unnamed
/// routes are left alone. Returns the removed route names.
pub fn reap_managed_routes(table: &mut RouteTable, managed: &[String]) -> Vec<String> {
    let managed: Vec<&str> = managed.iter().map(|m| m.trim()).filter(|m| !m.is_empty()).collect();
    if managed.is_empty() {
        return Vec::new();
    }
    let mut removed = Vec::new();
    table.spec.http.retain(|r| {
        let hit = managed.iter().any(|m| fold_eq(&r.name, m));
        if hit {
            removed.push(r.name.clone());
        }
        !hit
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;

    #[test]
    fn removes_only_managed_names_preserving_order() {
        let mut rt = table("rt1", vec![
            route("a", vec![dest("svc-s", 100)]),
            route("HR1", vec![dest("svc-c", 0)]),
            route("b", vec![dest("svc-s", 100)]),
            route("hr2", vec![dest("svc-c", 0)]),
        ]);
        let removed = reap_managed_routes(&mut rt, &["hr1".to_string()]);
        assert_eq!(removed, vec!["HR1"]);
        let names: Vec<_> = rt.spec.http.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "hr2"]);
    }

    #[test]
    fn nothing_declared_leaves_table_alone() {
        let mut rt = table("rt1", vec![route("hr1", vec![])]);
        let before = rt.clone();
        assert!(reap_managed_routes(&mut rt, &[]).is_empty());
        assert!(reap_managed_routes(&mut rt, &["other".to_string()]).is_empty());
        assert_eq!(rt, before);
    }

    #[test]
    fn empty_managed_name_keeps_unnamed_routes() {
        let mut rt = table("rt1", vec![route("", vec![dest("svc-s", 100)]), route("", vec![dest("svc-static", 100)])]);
        let before = rt.clone();
        assert!(reap_managed_routes(&mut rt, &["".to_string(), "  ".to_string()]).is_empty());
        assert_eq!(rt, before);
    }
}
