//! The cluster seam used by the applier, with an in-memory implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use kpt_core::{Error, ResId, Result};
use serde_json::Value as Json;

#[async_trait]
pub trait Cluster: Send + Sync {
    /// Live object, if any.
    async fn get(&self, id: &ResId) -> Result<Option<Json>>;
    /// Server-side applies `obj`; a dry run validates without persisting.
    async fn apply(&self, obj: &Json, dry_run: bool) -> Result<Json>;
    /// Deletes an object; false when it was already gone.
    async fn delete(&self, id: &ResId) -> Result<bool>;
    async fn is_namespaced(&self, group: &str, kind: &str) -> Result<bool>;
}

/// Identity of a manifest, with readable errors for incomplete documents.
pub fn object_id(obj: &Json) -> Result<ResId> {
    let api_version = obj
        .get("apiVersion")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::invalid_param("object missing apiVersion"))?;
    let kind = obj.get("kind").and_then(Json::as_str).ok_or_else(|| Error::invalid_param("object missing kind"))?;
    let meta = obj.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(Json::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::invalid_param(format!("{} object missing metadata.name", kind)))?;
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(Json::as_str);
    Ok(ResId::from_api_version(api_version, kind, namespace, name))
}

const CLUSTER_SCOPED: &[(&str, &str)] = &[
    ("", "Namespace"),
    ("", "PersistentVolume"),
    ("", "Node"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("storage.k8s.io", "StorageClass"),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration"),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration"),
];

#[derive(Default)]
struct State {
    objects: BTreeMap<ResId, Json>,
    version: u64,
    applied: u64,
}

/// Cluster kept in memory. Applies replace the stored object wholesale and
/// bump `metadata.resourceVersion`.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    cluster_scoped: BTreeSet<(String, String)>,
    rejected: Mutex<BTreeSet<String>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            cluster_scoped: CLUSTER_SCOPED.iter().map(|(g, k)| (g.to_string(), k.to_string())).collect(),
            ..Default::default()
        }
    }

    /// Seeds a live object as if someone else had created it.
    pub fn insert(&self, obj: Json) -> Result<ResId> {
        let id = object_id(&obj)?;
        if let Ok(mut st) = self.state.lock() {
            st.objects.insert(id.clone(), obj);
        }
        Ok(id)
    }

    pub fn object(&self, id: &ResId) -> Option<Json> {
        self.state.lock().ok().and_then(|st| st.objects.get(id).cloned())
    }

    pub fn ids(&self) -> Vec<ResId> {
        self.state.lock().map(|st| st.objects.keys().cloned().collect()).unwrap_or_default()
    }

    /// Number of persisted (non dry-run) applies.
    pub fn applied(&self) -> u64 {
        self.state.lock().map(|st| st.applied).unwrap_or(0)
    }

    /// Makes every apply of `kind` fail with an invalid-parameter error.
    pub fn reject_kind(&self, kind: &str) {
        if let Ok(mut r) = self.rejected.lock() {
            r.insert(kind.to_string());
        }
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get(&self, id: &ResId) -> Result<Option<Json>> {
        Ok(self.object(id))
    }

    async fn apply(&self, obj: &Json, dry_run: bool) -> Result<Json> {
        let id = object_id(obj)?;
        if self.rejected.lock().map(|r| r.contains(&id.kind)).unwrap_or(false) {
            return Err(Error::invalid_param(format!("{} rejected by admission", id)).with_op("cluster.apply"));
        }
        let mut st = self.state.lock().map_err(|_| Error::internal("cluster state poisoned"))?;
        let mut out = obj.clone();
        let version = st.version + 1;
        if let Some(meta) = out.get_mut("metadata").and_then(Json::as_object_mut) {
            meta.insert("resourceVersion".into(), Json::String(version.to_string()));
        }
        if !dry_run {
            st.version = version;
            st.applied += 1;
            st.objects.insert(id, out.clone());
        }
        Ok(out)
    }

    async fn delete(&self, id: &ResId) -> Result<bool> {
        let mut st = self.state.lock().map_err(|_| Error::internal("cluster state poisoned"))?;
        Ok(st.objects.remove(id).is_some())
    }

    async fn is_namespaced(&self, group: &str, kind: &str) -> Result<bool> {
        Ok(!self.cluster_scoped.contains(&(group.to_string(), kind.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_id_errors_are_friendly() {
        let e1 = object_id(&json!({"kind": "Foo", "metadata": {"name": "x"}})).unwrap_err();
        assert!(e1.message().contains("missing apiVersion"), "{}", e1);
        let e2 = object_id(&json!({"apiVersion": "v1", "metadata": {"name": "x"}})).unwrap_err();
        assert!(e2.message().contains("missing kind"), "{}", e2);
        let e3 = object_id(&json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}})).unwrap_err();
        assert!(e3.message().contains("missing metadata.name"), "{}", e3);
        let ok = object_id(&json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "w", "namespace": "n"}})).unwrap();
        assert_eq!(ok.to_string(), "Deployment.apps/n/w");
    }

    #[tokio::test]
    async fn dry_run_does_not_persist() {
        let c = MemoryCluster::new();
        let obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c", "namespace": "d"}});
        let out = c.apply(&obj, true).await.unwrap();
        assert_eq!(out["metadata"]["resourceVersion"], "1");
        assert!(c.ids().is_empty());
        c.apply(&obj, false).await.unwrap();
        assert_eq!(c.applied(), 1);
        assert!(!c.is_namespaced("", "Namespace").await.unwrap());
        assert!(c.is_namespaced("apps", "Deployment").await.unwrap());
    }
}
