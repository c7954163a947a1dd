//! In-process functions, looked up by exact image string.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kpt_core::{CancellationToken, Error, Result};
use kpt_yaml::{Node, Resource};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::resourcelist::ResourceList;
use crate::{FunctionRunner, FunctionSpec};

pub const SET_NAMESPACE_IMAGE: &str = "ghcr.io/kptdev/krm-functions-catalog/set-namespace:v0.4.1";
pub const SET_LABELS_IMAGE: &str = "ghcr.io/kptdev/krm-functions-catalog/set-labels:v0.2.0";

/// A function implemented in this process.
pub trait Processor: Send + Sync {
    fn process(&self, list: &mut ResourceList) -> Result<()>;
}

static DEFAULT_PROCESSORS: Lazy<BTreeMap<String, Arc<dyn Processor>>> = Lazy::new(|| {
    let set_namespace: Arc<dyn Processor> = Arc::new(SetNamespace);
    let set_labels: Arc<dyn Processor> = Arc::new(SetLabels);
    let mut m = BTreeMap::new();
    m.insert(SET_NAMESPACE_IMAGE.to_string(), set_namespace.clone());
    m.insert("gcr.io/kpt-fn/set-namespace:v0.4.1".to_string(), set_namespace);
    m.insert(SET_LABELS_IMAGE.to_string(), set_labels.clone());
    m.insert("gcr.io/kpt-fn/set-labels:v0.2.0".to_string(), set_labels);
    m
});

#[derive(Clone)]
pub struct BuiltinRunner {
    processors: BTreeMap<String, Arc<dyn Processor>>,
}

impl Default for BuiltinRunner {
    fn default() -> Self {
        Self { processors: DEFAULT_PROCESSORS.clone() }
    }
}

impl BuiltinRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry without the default functions.
    pub fn empty() -> Self {
        Self { processors: BTreeMap::new() }
    }

    pub fn with(mut self, image: &str, processor: Arc<dyn Processor>) -> Self {
        self.processors.insert(image.to_string(), processor);
        self
    }

    /// Makes `alias` (typically a pinned digest reference) run the same
    /// processor as the registered `image`.
    pub fn alias(mut self, alias: &str, image: &str) -> Result<Self> {
        let p = self
            .processors
            .get(image)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no builtin function registered for {}", image)))?;
        self.processors.insert(alias.to_string(), p);
        Ok(self)
    }

    pub fn supports(&self, image: &str) -> bool {
        self.processors.contains_key(image)
    }

    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }
}

#[async_trait]
impl FunctionRunner for BuiltinRunner {
    async fn run(&self, func: &FunctionSpec, input: &[u8], _cancel: &CancellationToken) -> Result<Vec<u8>> {
        let image = func.image.as_deref().unwrap_or_default();
        let processor = self
            .processors
            .get(image)
            .ok_or_else(|| Error::unsupported_function(format!("{} is not a builtin function", image)).with_op("fn.builtin"))?;
        let text = std::str::from_utf8(input).map_err(|e| Error::parse(format!("resource list is not utf-8: {}", e)))?;
        let mut list = ResourceList::decode(text)?;
        processor.process(&mut list).map_err(|e| e.with_op("fn.builtin"))?;
        debug!(image, items = list.items.len(), "builtin function done");
        Ok(list.encode()?.into_bytes())
    }
}

/// String entries of the function config: `data` of a ConfigMap, or
/// `field` of a typed config.
fn config_map(list: &ResourceList, field: &str) -> BTreeMap<String, String> {
    let Some(fc) = &list.function_config else {
        return BTreeMap::new();
    };
    let source = if fc.kind() == Some("ConfigMap") { fc.root().get("data") } else { fc.root().get(field) };
    source
        .and_then(Node::as_mapping)
        .map(|m| m.iter().filter_map(|(k, v)| v.scalar_string().map(|s| (k.clone(), s))).collect())
        .unwrap_or_default()
}

fn skipped(r: &Resource) -> bool {
    r.is_kptfile() || r.is_local_config()
}

fn cluster_scoped(r: &Resource) -> bool {
    matches!(
        (r.group(), r.kind().unwrap_or_default()),
        ("", "Namespace")
            | ("", "PersistentVolume")
            | ("apiextensions.k8s.io", "CustomResourceDefinition")
            | ("rbac.authorization.k8s.io", "ClusterRole")
            | ("rbac.authorization.k8s.io", "ClusterRoleBinding")
            | ("storage.k8s.io", "StorageClass")
    )
}

/// Moves every namespaced resource into one namespace. Namespace objects
/// named after the namespace being replaced are renamed with it, as are
/// ServiceAccount subjects of role bindings.
pub struct SetNamespace;

impl Processor for SetNamespace {
    fn process(&self, list: &mut ResourceList) -> Result<()> {
        let target = match &list.function_config {
            Some(fc) if fc.kind() != Some("ConfigMap") => fc.root().get_str("namespace").map(str::to_string),
            _ => config_map(list, "data").remove("namespace"),
        }
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::invalid_param("set-namespace: functionConfig must set namespace"))?;

        let previous: Vec<String> = {
            let mut seen: Vec<String> = list
                .items
                .iter()
                .filter(|r| !skipped(r) && !cluster_scoped(r))
                .filter_map(|r| r.namespace().map(str::to_string))
                .collect();
            seen.sort();
            seen.dedup();
            seen
        };
        for r in list.items.iter_mut().filter(|r| !skipped(r)) {
            if r.kind() == Some("Namespace") && r.group().is_empty() {
                if r.name().is_some_and(|n| previous.iter().any(|p| p == n)) || previous.is_empty() {
                    r.set_name(&target);
                }
                continue;
            }
            if cluster_scoped(r) {
                if r.kind() == Some("ClusterRoleBinding") {
                    retarget_subjects(r, &previous, &target);
                }
                continue;
            }
            if r.namespace() != Some(target.as_str()) {
                r.set_namespace(&target);
            }
            if r.kind() == Some("RoleBinding") {
                retarget_subjects(r, &previous, &target);
            }
        }
        Ok(())
    }
}

fn retarget_subjects(r: &mut Resource, previous: &[String], target: &str) {
    let Some(subjects) = r.root_mut().get_mut("subjects").and_then(Node::as_sequence_mut) else {
        return;
    };
    for s in subjects {
        let moves = s.get_str("kind") == Some("ServiceAccount")
            && s.get_str("namespace").map(|ns| previous.iter().any(|p| p == ns)).unwrap_or(false);
        if moves {
            s.set("namespace", Node::string(target));
        }
    }
}

/// Adds labels to every resource, and to pod templates and selectors of
/// workloads and services.
pub struct SetLabels;

const WORKLOADS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet"];

impl Processor for SetLabels {
    fn process(&self, list: &mut ResourceList) -> Result<()> {
        let labels = config_map(list, "labels");
        if labels.is_empty() {
            return Err(Error::invalid_param("set-labels: functionConfig has no labels"));
        }
        for r in list.items.iter_mut().filter(|r| !skipped(r)) {
            for (k, v) in &labels {
                if r.label(k) != Some(v.as_str()) {
                    r.set_label(k, v);
                }
            }
            let kind = r.kind().unwrap_or_default().to_string();
            if WORKLOADS.contains(&kind.as_str()) {
                set_all(r.root_mut(), &["spec", "template", "metadata", "labels"], &labels);
                set_all(r.root_mut(), &["spec", "selector", "matchLabels"], &labels);
            } else if kind == "Service" && r.group().is_empty() {
                set_all(r.root_mut(), &["spec", "selector"], &labels);
            }
        }
        Ok(())
    }
}

fn set_all(root: &mut Node, path: &[&str], values: &BTreeMap<String, String>) {
    let mut node = root;
    for key in path {
        let Some(next) = node.entry_mapping(key) else { return };
        node = next;
    }
    for (k, v) in values {
        if node.get_str(k) != Some(v.as_str()) {
            node.set(k, Node::string(v.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpt_yaml::parse_stream;

    fn items(src: &str) -> Vec<Resource> {
        parse_stream(src).unwrap()
    }

    fn config(data: &str) -> Option<Resource> {
        Some(parse_stream(&format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: fn\ndata:\n{}", data)).unwrap().remove(0))
    }

    #[test]
    fn set_namespace_moves_namespaced_resources() {
        let mut list = ResourceList::new(
            items(
                "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: old\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: old\n---\napiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: reader\n---\napiVersion: rbac.authorization.k8s.io/v1\nkind: RoleBinding\nmetadata:\n  name: rb\n  namespace: old\nsubjects:\n- kind: ServiceAccount\n  name: sa\n  namespace: old\n",
            ),
            config("  namespace: prod\n"),
        );
        SetNamespace.process(&mut list).unwrap();
        assert_eq!(list.items[0].name(), Some("prod"));
        assert_eq!(list.items[1].namespace(), Some("prod"));
        assert_eq!(list.items[2].namespace(), None);
        let subj = list.items[3].root().path_get("subjects[0].namespace").unwrap().unwrap();
        assert_eq!(subj.as_str(), Some("prod"));
    }

    #[test]
    fn set_namespace_requires_config() {
        let mut list = ResourceList::new(items("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n"), None);
        assert!(SetNamespace.process(&mut list).is_err());
    }

    #[test]
    fn set_labels_reaches_templates_and_selectors() {
        let mut list = ResourceList::new(
            items(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: web\n",
            ),
            config("  app: web\n  tier: front\n"),
        );
        SetLabels.process(&mut list).unwrap();
        assert_eq!(list.items[0].label("tier"), Some("front"));
        let tpl = list.items[0].root().path_get("spec.template.metadata.labels.app").unwrap().unwrap();
        assert_eq!(tpl.as_str(), Some("web"));
        let sel = list.items[1].root().path_get("spec.selector.app").unwrap().unwrap();
        assert_eq!(sel.as_str(), Some("web"));
    }

    #[tokio::test]
    async fn unknown_images_are_unsupported() {
        let runner = BuiltinRunner::new();
        let spec = FunctionSpec::image("example.com/fns/unknown:v1");
        let err = runner.run(&spec, b"", &CancellationToken::new()).await.unwrap_err();
        assert!(err.is(kpt_core::ErrorKind::UnsupportedFunction));
        let digest = format!("example.com/set-ns@sha256:{}", "a".repeat(64));
        let aliased = runner.alias(&digest, SET_NAMESPACE_IMAGE).unwrap();
        assert!(aliased.supports(&digest));
    }
}
