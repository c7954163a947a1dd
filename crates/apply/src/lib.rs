//! kpt live: applies a package to a cluster, records what was applied in a
//! ResourceGroup inventory, prunes objects that left the package and
//! destroys everything an inventory owns.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod inventory;
pub mod live;

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use kpt_core::{check_cancelled, CancellationToken, Error, ResId, Result};
use kpt_pkg::{kptfile_of, read_resources, FileSet, ReadOptions};
use kpt_yaml::Resource;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub use cluster::{object_id, Cluster, MemoryCluster};
pub use inventory::InventoryRef;
pub use kpt_kubehub::strip_noisy;
pub use live::KubeCluster;

use inventory::{keep_on_remove, members, owner_of, OWNING_INVENTORY_ANNOTATION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryPolicy {
    /// Refuse objects owned by another inventory.
    #[default]
    Strict,
    /// Take ownership of objects owned by another inventory.
    Adopt,
}

impl std::str::FromStr for InventoryPolicy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strict" => Ok(Self::Strict),
            "adopt" => Ok(Self::Adopt),
            other => Err(Error::invalid_param(format!("unknown inventory policy {:?} (want strict or adopt)", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub policy: InventoryPolicy,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Created,
    Configured,
    Unchanged,
    Pruned,
    Deleted,
    /// Left in place by an on-remove annotation or foreign ownership.
    Skipped,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Created => "created",
            ActionKind::Configured => "configured",
            ActionKind::Unchanged => "unchanged",
            ActionKind::Pruned => "pruned",
            ActionKind::Deleted => "deleted",
            ActionKind::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ResId,
    pub kind: ActionKind,
    /// Field-level difference against live state.
    pub summary: DiffSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub inventory_id: String,
    pub dry_run: bool,
    pub actions: Vec<Action>,
}

impl ApplyReport {
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }
}

/// Counts leaf differences of `target` relative to `base`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, out: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                out.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                out.adds += aa.len().saturating_sub(bb.len());
                out.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) if av != bv => out.updates += 1,
            _ => {}
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}

/// Namespaces and CRDs first so their contents can be created.
fn apply_rank(id: &ResId) -> u8 {
    match (id.group.as_str(), id.kind.as_str()) {
        ("", "Namespace") => 0,
        ("apiextensions.k8s.io", "CustomResourceDefinition") => 1,
        _ => 2,
    }
}

fn set_annotation(obj: &mut Json, key: &str, value: &str) {
    let Some(root) = obj.as_object_mut() else { return };
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
    let Some(meta) = meta.as_object_mut() else { return };
    let ann = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
    if let Some(ann) = ann.as_object_mut() {
        ann.insert(key.to_string(), Json::String(value.to_string()));
    }
}

fn set_namespace(obj: &mut Json, namespace: &str) {
    if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.insert("namespace".into(), Json::String(namespace.to_string()));
    }
}

/// Package objects that go to the cluster: everything but the Kptfiles and
/// local-config resources, with internal annotations removed.
pub fn package_objects(files: &FileSet) -> Result<Vec<Json>> {
    let opts = ReadOptions { include_subpackages: true, ..Default::default() };
    let resources = read_resources(files, &opts)?;
    Ok(resources
        .iter()
        .filter(|r| !r.is_kptfile() && !r.is_local_config())
        .map(resource_json)
        .collect())
}

struct Planned {
    id: ResId,
    obj: Json,
    live: Option<Json>,
}

/// Drives apply and destroy against a [`Cluster`].
pub struct Applier {
    cluster: Arc<dyn Cluster>,
}

impl Applier {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        Self { cluster }
    }

    /// Applies the package at `dir` and records it in its inventory.
    ///
    /// Ownership of every object is checked before anything is written. The
    /// inventory is first widened to previous ∪ current, so an interrupted
    /// apply never forgets an object, and narrowed to current after pruning.
    pub async fn apply(&self, dir: &Path, opts: ApplyOptions, cancel: &CancellationToken) -> Result<ApplyReport> {
        let t0 = Instant::now();
        let files = FileSet::from_dir(dir).map_err(|e| e.with_op("live.apply"))?;
        let kptfile = kptfile_of(&files).map_err(|e| e.with_path(dir))?;
        let inv = InventoryRef::from_kptfile(kptfile.inventory.as_ref()).map_err(|e| e.with_path(dir).with_op("live.apply"))?;

        let plan = self.plan(package_objects(&files)?, &inv, opts.policy, cancel).await.map_err(|e| e.with_path(dir))?;
        let current: BTreeSet<ResId> = plan.iter().map(|p| p.id.clone()).collect();

        let live_inv = self.cluster.get(&inv.res_id()).await?;
        if let Some(live) = &live_inv {
            inv.check_live(live).map_err(|e| e.with_op("live.apply"))?;
        }
        let previous: Vec<ResId> = match &live_inv {
            Some(obj) => members(obj)?,
            None => Vec::new(),
        };
        let stale: Vec<ResId> = previous.iter().filter(|id| !current.contains(*id)).cloned().collect();

        let mut actions = Vec::with_capacity(plan.len() + stale.len());
        if opts.dry_run {
            for p in &plan {
                check_cancelled(cancel, "live.apply")?;
                let out = self.cluster.apply(&p.obj, true).await.map_err(|e| e.with_op("live.apply"))?;
                actions.push(Action { id: p.id.clone(), kind: classify(p.live.as_ref(), &out), summary: summarize(&out, p.live.as_ref()) });
            }
            for id in stale {
                actions.push(Action { id, kind: ActionKind::Pruned, summary: DiffSummary::default() });
            }
            info!(pkg = %dir.display(), inventory = %inv.id, objects = actions.len(), "dry-run apply complete");
            return Ok(ApplyReport { inventory_id: inv.id, dry_run: true, actions });
        }

        let union: BTreeSet<ResId> = previous.iter().cloned().chain(current.iter().cloned()).collect();
        self.cluster.apply(&inv.object(&union), false).await.map_err(|e| e.with_op("live.apply"))?;

        for p in &plan {
            check_cancelled(cancel, "live.apply")?;
            let out = self.cluster.apply(&p.obj, false).await.map_err(|e| e.with_op("live.apply"))?;
            let kind = classify(p.live.as_ref(), &out);
            debug!(object = %p.id, action = %kind, "applied");
            actions.push(Action { id: p.id.clone(), kind, summary: summarize(&out, p.live.as_ref()) });
        }

        // Kept and foreign-owned objects leave the inventory with the rest.
        for id in sort_for_delete(stale) {
            check_cancelled(cancel, "live.apply")?;
            let kind = self.remove(&id, &inv, ActionKind::Pruned).await?;
            actions.push(Action { id, kind, summary: DiffSummary::default() });
        }
        self.cluster.apply(&inv.object(&current), false).await.map_err(|e| e.with_op("live.apply"))?;

        histogram!("kpt_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kpt_apply_total", 1u64, "op" => "apply");
        let report = ApplyReport { inventory_id: inv.id, dry_run: false, actions };
        info!(
            pkg = %dir.display(),
            inventory = %report.inventory_id,
            created = report.count(ActionKind::Created),
            configured = report.count(ActionKind::Configured),
            pruned = report.count(ActionKind::Pruned),
            took_ms = %t0.elapsed().as_millis(),
            "applied package"
        );
        Ok(report)
    }

    /// Deletes every object the package's inventory owns, then the inventory.
    pub async fn destroy(&self, dir: &Path, cancel: &CancellationToken) -> Result<ApplyReport> {
        let t0 = Instant::now();
        let files = FileSet::from_dir(dir).map_err(|e| e.with_op("live.destroy"))?;
        let kptfile = kptfile_of(&files).map_err(|e| e.with_path(dir))?;
        let inv = InventoryRef::from_kptfile(kptfile.inventory.as_ref()).map_err(|e| e.with_path(dir).with_op("live.destroy"))?;

        let Some(live) = self.cluster.get(&inv.res_id()).await? else {
            info!(pkg = %dir.display(), inventory = %inv.id, "no inventory object on the cluster; nothing to destroy");
            return Ok(ApplyReport { inventory_id: inv.id, dry_run: false, actions: Vec::new() });
        };
        inv.check_live(&live).map_err(|e| e.with_op("live.destroy"))?;

        let mut actions = Vec::new();
        for id in sort_for_delete(members(&live)?) {
            check_cancelled(cancel, "live.destroy")?;
            let kind = self.remove(&id, &inv, ActionKind::Deleted).await?;
            actions.push(Action { id, kind, summary: DiffSummary::default() });
        }
        self.cluster.delete(&inv.res_id()).await.map_err(|e| e.with_op("live.destroy"))?;

        histogram!("kpt_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kpt_apply_total", 1u64, "op" => "destroy");
        info!(pkg = %dir.display(), inventory = %inv.id, objects = actions.len(), took_ms = %t0.elapsed().as_millis(), "destroyed package");
        Ok(ApplyReport { inventory_id: inv.id, dry_run: false, actions })
    }

    /// Normalizes objects, fetches live state and enforces the policy for
    /// all of them before any write.
    async fn plan(&self, objects: Vec<Json>, inv: &InventoryRef, policy: InventoryPolicy, cancel: &CancellationToken) -> Result<Vec<Planned>> {
        let mut plan = Vec::with_capacity(objects.len());
        let mut seen = BTreeSet::new();
        for mut obj in objects {
            check_cancelled(cancel, "live.apply")?;
            let mut id = object_id(&obj).map_err(|e| e.with_op("live.apply"))?;
            let namespaced = self.cluster.is_namespaced(&id.group, &id.kind).await?;
            match (namespaced, id.namespace.is_some()) {
                (true, false) => {
                    set_namespace(&mut obj, &inv.namespace);
                    id.namespace = Some(inv.namespace.clone());
                }
                (false, true) => {
                    if let Some(meta) = obj.get_mut("metadata").and_then(Json::as_object_mut) {
                        meta.remove("namespace");
                    }
                    id.namespace = None;
                }
                _ => {}
            }
            if !seen.insert(id.clone()) {
                return Err(Error::invalid_param(format!("{} appears more than once in the package", id)).with_op("live.apply"));
            }
            let live = self.cluster.get(&id).await?;
            if let Some(owner) = live.as_ref().and_then(owner_of) {
                if owner != inv.id {
                    match policy {
                        InventoryPolicy::Strict => {
                            return Err(Error::already_exists(format!(
                                "{} is owned by inventory {}; use the adopt policy to take it over",
                                id, owner
                            ))
                            .with_op("live.apply"));
                        }
                        InventoryPolicy::Adopt => warn!(object = %id, from = %owner, "adopting object"),
                    }
                }
            }
            set_annotation(&mut obj, OWNING_INVENTORY_ANNOTATION, &inv.id);
            plan.push(Planned { id, obj, live });
        }
        plan.sort_by_key(|p| apply_rank(&p.id));
        Ok(plan)
    }

    /// Deletes one inventory member unless it is kept or owned elsewhere.
    async fn remove(&self, id: &ResId, inv: &InventoryRef, done: ActionKind) -> Result<ActionKind> {
        let Some(live) = self.cluster.get(id).await? else {
            return Ok(done);
        };
        if keep_on_remove(&live) {
            debug!(object = %id, "kept by on-remove annotation");
            return Ok(ActionKind::Skipped);
        }
        if owner_of(&live).is_some_and(|o| o != inv.id) {
            warn!(object = %id, "owned by another inventory; not deleting");
            return Ok(ActionKind::Skipped);
        }
        self.cluster.delete(id).await.map_err(|e| e.with_op("live.delete"))?;
        Ok(done)
    }
}

/// Reverse apply order: contents before their namespaces and CRDs.
fn sort_for_delete(mut ids: Vec<ResId>) -> Vec<ResId> {
    ids.sort_by_key(|id| std::cmp::Reverse(apply_rank(id)));
    ids
}

fn classify(live: Option<&Json>, applied: &Json) -> ActionKind {
    match live {
        None => ActionKind::Created,
        Some(l) if comparable(l) == comparable(applied) => ActionKind::Unchanged,
        Some(_) => ActionKind::Configured,
    }
}

fn summarize(applied: &Json, live: Option<&Json>) -> DiffSummary {
    let base = live.map(comparable).unwrap_or_else(|| Json::Object(Default::default()));
    diff_summary(&comparable(applied), &base)
}

fn comparable(v: &Json) -> Json {
    strip_noisy(v.clone())
}

/// A resource as the cluster sees it.
pub fn resource_json(r: &Resource) -> Json {
    r.without_internal_annotations().root().to_json()
}
