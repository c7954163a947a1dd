//! Resource-level join of three package snapshots.

use std::collections::{HashMap, HashSet};

use kpt_core::{ResId, KPTFILE_NAME};
use kpt_yaml::{Node, Resource};
use tracing::debug;

use crate::kptfile::merge_kptfile;
use crate::tree::TreeMerger;

/// Join key: identity, with nameless resources keyed by their location.
fn key_of(r: &Resource) -> ResId {
    let id = r.identity();
    if !id.name.is_empty() {
        return id;
    }
    let at = format!("{}#{}", r.path_annotation().unwrap_or(""), r.index_annotation().unwrap_or(0));
    ResId { name: at, ..id }
}

fn is_root_kptfile(r: &Resource) -> bool {
    r.is_kptfile() && r.path_annotation().map(|p| p == KPTFILE_NAME).unwrap_or(true)
}

fn index(rs: &[Resource]) -> HashMap<ResId, &Resource> {
    rs.iter().filter(|r| !is_root_kptfile(r)).map(|r| (key_of(r), r)).collect()
}

/// Replaces the tree of `base` with `merged`, keeping `base` untouched
/// when nothing changed so its original text survives.
pub(crate) fn rebuild(base: &Resource, merged: Node) -> Resource {
    if merged.identical(base.root()) {
        return base.clone();
    }
    let mut out = base.clone();
    *out.root_mut() = merged;
    out
}

/// Three-way merge of resource lists joined by identity.
///
/// Output keeps local order, followed by resources upstream added. The root
/// Kptfile is joined by location rather than identity and merged with the
/// Kptfile rules.
pub fn merge_resources(origin: &[Resource], updated: &[Resource], local: &[Resource]) -> Vec<Resource> {
    let merger = TreeMerger::default();
    let (oi, ui) = (index(origin), index(updated));
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let kptfile = |rs: &[Resource]| rs.iter().find(|r| is_root_kptfile(r)).cloned();
    let (ok, uk, lk) = (kptfile(origin), kptfile(updated), kptfile(local));
    if let Some(k) = merge_kptfile(ok.as_ref(), uk.as_ref(), lk.as_ref()) {
        out.push(k);
    }

    for l in local.iter().filter(|r| !is_root_kptfile(r)) {
        let key = key_of(l);
        let (o, u) = (oi.get(&key).copied(), ui.get(&key).copied());
        match (o, u) {
            // Deleted upstream.
            (Some(_), None) => debug!(resource = %key, "dropping resource removed upstream"),
            (None, None) => out.push(l.clone()),
            (o, Some(u)) => {
                let Some(merged) = merger.merge(o.map(Resource::root), Some(u.root()), Some(l.root())) else {
                    continue;
                };
                // Taking upstream wholesale in place keeps its text too.
                let same_place = u.path_annotation() == l.path_annotation();
                if same_place && merged.identical(u.root()) && !merged.identical(l.root()) {
                    out.push(u.clone());
                } else {
                    out.push(rebuild(l, merged));
                }
            }
        }
        seen.insert(key);
    }
    for u in updated.iter().filter(|r| !is_root_kptfile(r)) {
        let key = key_of(u);
        if seen.contains(&key) {
            continue;
        }
        // Present before and gone locally: the user deleted it.
        if oi.contains_key(&key) {
            continue;
        }
        out.push(u.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(src: &str) -> Vec<Resource> {
        let mut rs = kpt_yaml::parse_stream(src).unwrap();
        for (i, r) in rs.iter_mut().enumerate() {
            r.set_location("all.yaml", i);
        }
        rs
    }

    fn cm(name: &str, data: &str) -> String {
        format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\ndata:\n  v: {}\n", name, data)
    }

    fn names(rs: &[Resource]) -> Vec<&str> {
        rs.iter().map(|r| r.name().unwrap()).collect()
    }

    #[test]
    fn identity_join_rules() {
        let origin = docs(&[cm("kept", "1"), cm("user-deleted", "1"), cm("upstream-deleted", "1")].join("---\n"));
        let updated = docs(&[cm("kept", "2"), cm("user-deleted", "2"), cm("upstream-added", "1")].join("---\n"));
        let local = docs(&[cm("user-added", "1"), cm("kept", "1"), cm("upstream-deleted", "9")].join("---\n"));
        let out = merge_resources(&origin, &updated, &local);
        assert_eq!(names(&out), vec!["user-added", "kept", "upstream-added"]);
        assert_eq!(out[1].root().path_get("data.v").unwrap().unwrap().as_i64(), Some(2));
    }

    #[test]
    fn unchanged_resources_keep_their_text() {
        let src = format!("# note\n{}", cm("a", "1"));
        let local = docs(&src);
        let out = merge_resources(&local, &local, &local);
        assert!(out[0].is_pristine());
        assert_eq!(out[0].body(), local[0].body());
    }

    #[test]
    fn namespaces_are_part_of_identity() {
        let a = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n  namespace: a\n";
        let b = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n  namespace: b\n";
        let out = merge_resources(&[], &docs(b), &docs(a));
        assert_eq!(out.len(), 2);
    }
}
