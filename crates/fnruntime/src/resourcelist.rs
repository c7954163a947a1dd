//! The `config.kubernetes.io/v1` ResourceList exchanged with functions.

use kpt_core::{Error, Result, ResultExt};
use kpt_yaml::{parse_stream, Node, Resource};
use serde::{Deserialize, Serialize};

pub const RESOURCE_LIST_API_VERSION: &str = "config.kubernetes.io/v1";
pub const RESOURCE_LIST_KIND: &str = "ResourceList";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    #[default]
    Info,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

/// One entry of a function's `results`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FnResult {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
}

impl FnResult {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for FnResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.severity, self.message)?;
        if let Some(r) = &self.resource_ref {
            write!(f, " ({} {})", r.kind, r.name)?;
        }
        if let Some(file) = &self.file {
            write!(f, " in {}", file.path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub items: Vec<Resource>,
    pub function_config: Option<Resource>,
    pub results: Vec<FnResult>,
}

impl ResourceList {
    pub fn new(items: Vec<Resource>, function_config: Option<Resource>) -> Self {
        Self { items, function_config, results: Vec::new() }
    }

    pub fn encode(&self) -> Result<String> {
        let mut root = Node::mapping();
        root.set("apiVersion", Node::string(RESOURCE_LIST_API_VERSION));
        root.set("kind", Node::string(RESOURCE_LIST_KIND));
        root.set("items", Node::sequence(self.items.iter().map(|r| r.root().clone()).collect()));
        if let Some(fc) = &self.function_config {
            root.set("functionConfig", fc.root().clone());
        }
        if !self.results.is_empty() {
            root.set("results", Node::encode(&self.results)?);
        }
        Ok(Resource::from(root).body())
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut docs = parse_stream(text).op("fn.decode")?;
        if docs.len() != 1 {
            return Err(Error::parse(format!("expected one ResourceList document, got {}", docs.len())).with_op("fn.decode"));
        }
        let doc = docs.remove(0);
        if doc.kind() != Some(RESOURCE_LIST_KIND) {
            return Err(Error::parse(format!("expected kind ResourceList, got {:?}", doc.kind())).with_op("fn.decode"));
        }
        let root = doc.into_root();
        let items = match root.get("items") {
            None => Vec::new(),
            Some(n) if n.is_null() => Vec::new(),
            Some(n) => n
                .as_sequence()
                .ok_or_else(|| Error::parse("ResourceList items is not a list").with_op("fn.decode"))?
                .iter()
                .map(|item| Resource::from(item.clone()))
                .collect(),
        };
        let function_config = root.get("functionConfig").filter(|n| !n.is_null()).map(|n| Resource::from(n.clone()));
        let results = match root.get("results") {
            Some(n) if !n.is_null() => n.decode::<Vec<FnResult>>().op("fn.decode")?,
            _ => Vec::new(),
        };
        Ok(Self { items, function_config, results })
    }

    pub fn errors(&self) -> impl Iterator<Item = &FnResult> {
        self.results.iter().filter(|r| r.is_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_items_config_and_results() {
        let text = r#"apiVersion: config.kubernetes.io/v1
kind: ResourceList
items:
- apiVersion: v1
  kind: ConfigMap
  metadata:
    name: a
functionConfig:
  apiVersion: v1
  kind: ConfigMap
  data:
    namespace: prod
results:
- message: missing label
  severity: error
  resourceRef:
    apiVersion: v1
    kind: ConfigMap
    name: a
  file:
    path: cm.yaml
"#;
        let list = ResourceList::decode(text).unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].name(), Some("a"));
        assert_eq!(list.function_config.unwrap().root().path_get("data.namespace").unwrap().unwrap().as_str(), Some("prod"));
        assert_eq!(list.results.len(), 1);
        assert!(list.results[0].is_error());
        assert_eq!(list.results[0].file.as_ref().unwrap().path, "cm.yaml");
    }

    #[test]
    fn encode_then_decode_keeps_items() {
        let list = ResourceList::new(vec![Resource::new("v1", "Service", "web")], None);
        let back = ResourceList::decode(&list.encode().unwrap()).unwrap();
        assert_eq!(back.items[0].kind(), Some("Service"));
        assert!(back.function_config.is_none());
    }

    #[test]
    fn rejects_other_kinds() {
        let err = ResourceList::decode("apiVersion: v1\nkind: ConfigMap\n").unwrap_err();
        assert!(err.is(kpt_core::ErrorKind::ParseError));
    }
}
