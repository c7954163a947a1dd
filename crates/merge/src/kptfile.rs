//! Kptfile merge rules.
//!
//! The pipeline merges structurally with function names (or images) as
//! associative keys. Local `metadata.name`, `upstream`, `upstreamLock` and a
//! populated `inventory` always survive; callers rewrite the upstream pair
//! afterwards with the values they fetched. An upstream `inventory` is never
//! adopted: a package without one stays without one.

use kpt_yaml::{Node, Resource};

use crate::resource::rebuild;
use crate::tree::TreeMerger;

const LOCAL_OWNED: &[&str] = &["upstream", "upstreamLock"];

pub fn merge_kptfile(origin: Option<&Resource>, updated: Option<&Resource>, local: Option<&Resource>) -> Option<Resource> {
    let Some(local) = local else {
        // No local Kptfile means the package is new here.
        return updated.cloned();
    };
    let Some(updated) = updated else {
        return Some(local.clone());
    };
    let merger = TreeMerger::with_keys(&["name", "image", "conditionType"]);
    let mut merged = merger
        .merge(origin.map(Resource::root), Some(updated.root()), Some(local.root()))
        .unwrap_or_else(|| local.root().clone());
    restore_local(&mut merged, local.root());
    Some(rebuild(local, merged))
}

fn restore_local(merged: &mut Node, local: &Node) {
    for key in LOCAL_OWNED {
        match local.get(key) {
            Some(v) => merged.set(key, v.clone()),
            None => {
                merged.remove(key);
            }
        }
    }
    match local.get("inventory").filter(|n| !n.is_null()) {
        Some(inv) => merged.set("inventory", inv.clone()),
        None => {
            merged.remove("inventory");
        }
    }
    if let (Some(name), Some(meta)) = (local.path_get("metadata.name").ok().flatten(), merged.entry_mapping("metadata")) {
        meta.set("name", name.clone());
    }
}

/// `updated` with the local inventory block and package name carried over.
pub fn replace_keeping_inventory(updated: &Resource, local: Option<&Resource>) -> Resource {
    let mut out = updated.clone();
    match local.and_then(|l| l.root().get("inventory")) {
        Some(inv) => out.root_mut().set("inventory", inv.clone()),
        None => {
            out.root_mut().remove("inventory");
        }
    }
    if let Some(name) = local.and_then(|l| l.name()) {
        out.set_name(name);
    }
    if out.root().identical(updated.root()) {
        return updated.clone();
    }
    out
}

/// Kptfile tree without the blocks a merge never compares. The package
/// name follows the local directory, so it is dropped too.
pub fn comparable(kptfile: &Resource) -> Node {
    let mut root = kptfile.root().clone();
    for key in LOCAL_OWNED.iter().chain(["inventory", "status"].iter()) {
        root.remove(key);
    }
    if let Some(meta) = root.get_mut("metadata") {
        meta.remove("name");
    }
    root
}
