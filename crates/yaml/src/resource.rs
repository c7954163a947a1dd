//! KRM resources: a document root plus the source text needed to write it back
//! unchanged when nothing was edited.

use std::collections::BTreeMap;

use kpt_core::{
    identity::group_of, Error, ResId, Result, INDEX_ANNOTATION, LEGACY_INDEX_ANNOTATION, LEGACY_PATH_ANNOTATION,
    LOCAL_CONFIG_ANNOTATION, PATH_ANNOTATION,
};

use crate::emit::{emit, EmitOptions};
use crate::node::Node;
use crate::parse::{parse_document, split};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Yaml,
    Json,
}

impl Format {
    /// Chooses the format from a file name; only `.json` is JSON.
    pub fn for_path(path: &str) -> Self {
        if path.ends_with(".json") {
            Format::Json
        } else {
            Format::Yaml
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resource {
    root: Node,
    pristine: Option<Node>,
    raw: Option<String>,
    leading: String,
    trailing: String,
    foot: Vec<String>,
    layout: EmitOptions,
    format: Format,
}

impl From<Node> for Resource {
    fn from(root: Node) -> Self {
        Resource {
            root,
            pristine: None,
            raw: None,
            leading: String::new(),
            trailing: String::new(),
            foot: Vec::new(),
            layout: EmitOptions::default(),
            format: Format::Yaml,
        }
    }
}

impl Resource {
    pub fn new(api_version: &str, kind: &str, name: &str) -> Self {
        let mut root = Node::mapping();
        root.set("apiVersion", Node::string(api_version));
        root.set("kind", Node::string(kind));
        let mut meta = Node::mapping();
        meta.set("name", Node::string(name));
        root.set("metadata", meta);
        Resource::from(root)
    }

    /// Serializes any value (typically a typed struct) into a resource.
    pub fn from_value<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Resource::from(Node::encode(value)?))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        self.root.decode()
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    pub fn into_root(self) -> Node {
        self.root
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    /// True when the tree still matches what was parsed, comments included.
    pub fn is_pristine(&self) -> bool {
        self.pristine.as_ref().map(|p| p.identical(&self.root)).unwrap_or(false)
    }

    pub fn api_version(&self) -> Option<&str> {
        self.root.get_str("apiVersion")
    }

    pub fn kind(&self) -> Option<&str> {
        self.root.get_str("kind")
    }

    pub fn name(&self) -> Option<&str> {
        self.root.get("metadata").and_then(|m| m.get_str("name"))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.root.get("metadata").and_then(|m| m.get_str("namespace")).filter(|n| !n.is_empty())
    }

    pub fn group(&self) -> &str {
        self.api_version().map(group_of).unwrap_or("")
    }

    pub fn identity(&self) -> ResId {
        ResId::new(self.group(), self.kind().unwrap_or(""), self.namespace(), self.name().unwrap_or(""))
    }

    pub fn is_kptfile(&self) -> bool {
        self.kind() == Some(kpt_core::KPTFILE_KIND) && self.group() == "kpt.dev"
    }

    pub fn is_local_config(&self) -> bool {
        self.annotation(LOCAL_CONFIG_ANNOTATION).map(|v| v == "true").unwrap_or(false)
    }

    fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        let Some(m) = self.root.get("metadata").and_then(|m| m.get(field)).and_then(Node::as_mapping) else {
            return BTreeMap::new();
        };
        m.iter().filter_map(|(k, v)| v.scalar_string().map(|s| (k.clone(), s))).collect()
    }

    fn set_in_metadata(&mut self, field: &str, key: &str, value: &str) {
        if let Some(map) = self.root.entry_mapping("metadata").and_then(|m| m.entry_mapping(field)) {
            map.set(key, Node::string(value));
        }
    }

    fn remove_from_metadata(&mut self, field: &str, key: &str) -> Option<Node> {
        self.root.get_mut("metadata")?.get_mut(field)?.remove(key)
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.string_map("annotations")
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.root.get("metadata")?.get("annotations")?.get_str(key)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set_in_metadata("annotations", key, value);
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<Node> {
        self.remove_from_metadata("annotations", key)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.string_map("labels")
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.root.get("metadata")?.get("labels")?.get_str(key)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.set_in_metadata("labels", key, value);
    }

    pub fn set_name(&mut self, name: &str) {
        if let Some(m) = self.root.entry_mapping("metadata") {
            m.set("name", Node::string(name));
        }
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        if let Some(m) = self.root.entry_mapping("metadata") {
            m.set("namespace", Node::string(namespace));
        }
    }

    /// Package-relative source file, falling back to the legacy annotation.
    pub fn path_annotation(&self) -> Option<&str> {
        self.annotation(PATH_ANNOTATION).or_else(|| self.annotation(LEGACY_PATH_ANNOTATION))
    }

    pub fn index_annotation(&self) -> Option<usize> {
        self.annotation(INDEX_ANNOTATION)
            .or_else(|| self.annotation(LEGACY_INDEX_ANNOTATION))
            .and_then(|s| s.parse().ok())
    }

    pub fn set_location(&mut self, path: &str, index: usize) {
        self.set_annotation(PATH_ANNOTATION, path);
        self.set_annotation(INDEX_ANNOTATION, &index.to_string());
    }

    /// Drops the path/index bookkeeping annotations. An `annotations` or
    /// `metadata` mapping left empty is removed unless the source had it.
    pub fn strip_internal_annotations(&mut self) {
        for key in [PATH_ANNOTATION, INDEX_ANNOTATION, LEGACY_PATH_ANNOTATION, LEGACY_INDEX_ANNOTATION] {
            self.remove_annotation(key);
        }
        let had = |field: &str| {
            self.pristine
                .as_ref()
                .and_then(|p| p.get("metadata"))
                .map(|m| field.is_empty() || m.get(field).is_some())
                .unwrap_or(false)
        };
        let keep_annotations = had("annotations");
        let keep_metadata = had("");
        if let Some(meta) = self.root.get_mut("metadata") {
            let empty = meta.get("annotations").and_then(Node::as_mapping).map(|m| m.is_empty()).unwrap_or(false);
            if empty && !keep_annotations {
                meta.remove("annotations");
            }
        }
        let meta_empty = self.root.get("metadata").and_then(Node::as_mapping).map(|m| m.is_empty()).unwrap_or(false);
        if meta_empty && !keep_metadata {
            self.root.remove("metadata");
        }
    }

    pub fn without_internal_annotations(&self) -> Resource {
        let mut r = self.clone();
        r.strip_internal_annotations();
        r
    }

    /// Serialized document text without separators. Untouched YAML documents
    /// come back byte-for-byte as they were read.
    pub fn body(&self) -> String {
        match self.format {
            Format::Json => {
                let mut s = serde_json::to_string_pretty(&self.root.to_json()).unwrap_or_default();
                s.push('\n');
                s
            }
            Format::Yaml => {
                if let Some(raw) = &self.raw {
                    if self.is_pristine() {
                        return raw.clone();
                    }
                }
                emit(&self.root, &self.foot, self.layout)
            }
        }
    }

    pub fn to_yaml_string(&self) -> String {
        self.body()
    }
}

/// Parses a (possibly multi-document) YAML stream. Empty and comment-only
/// documents are dropped; their text is kept with the neighbouring document.
pub fn parse_stream(src: &str) -> Result<Vec<Resource>> {
    let mut out: Vec<Resource> = Vec::new();
    let mut carry = String::new();
    for chunk in split(src) {
        match parse_document(chunk.body, chunk.offset)? {
            None => {
                carry.push_str(&chunk.leading);
                carry.push_str(chunk.body);
            }
            Some(parsed) => {
                let mut leading = std::mem::take(&mut carry);
                leading.push_str(&chunk.leading);
                let defaults = EmitOptions::default();
                out.push(Resource {
                    pristine: Some(parsed.root.clone()),
                    root: parsed.root,
                    raw: Some(chunk.body.to_string()),
                    leading,
                    trailing: String::new(),
                    foot: parsed.foot,
                    layout: EmitOptions {
                        indent: parsed.map_indent.filter(|i| *i > 0).unwrap_or(defaults.indent),
                        seq_offset: parsed.seq_offset.unwrap_or(defaults.seq_offset),
                    },
                    format: Format::Yaml,
                });
            }
        }
    }
    if let Some(last) = out.last_mut() {
        last.trailing = carry;
    }
    tracing::trace!(documents = out.len(), "parsed yaml stream");
    Ok(out)
}

pub fn parse_json(src: &str) -> Result<Resource> {
    let value: serde_json::Value = serde_json::from_str(src).map_err(|e| {
        let offset = offset_of(src, e.line(), e.column());
        Error::from(e).with_offset(offset)
    })?;
    let root = Node::from_json(&value);
    let mut r = Resource::from(root.clone());
    r.pristine = Some(root);
    r.format = Format::Json;
    Ok(r)
}

/// Parses a file's content according to its name.
pub fn parse_file(path: &str, src: &str) -> Result<Vec<Resource>> {
    match Format::for_path(path) {
        Format::Json => Ok(vec![parse_json(src)?]),
        Format::Yaml => parse_stream(src),
    }
}

fn offset_of(src: &str, line: usize, column: usize) -> usize {
    let line_start: usize = src.split_inclusive('\n').take(line.saturating_sub(1)).map(str::len).sum();
    line_start + column.saturating_sub(1)
}

fn has_separator(text: &str) -> bool {
    text.lines().any(|l| {
        let t = l.trim_end();
        t == "---" || t.starts_with("--- ")
    })
}

/// Serializes resources as one stream, inserting `---` where a document has
/// no separator of its own.
pub fn serialize_stream(resources: &[Resource]) -> String {
    if let [only] = resources {
        if only.format == Format::Json {
            return only.body();
        }
    }
    let mut out = String::new();
    for (i, r) in resources.iter().enumerate() {
        if i > 0 {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            if !has_separator(&r.leading) {
                out.push_str("---\n");
            }
        }
        out.push_str(&r.leading);
        let body = if r.format == Format::Json { r.clone().into_yaml().body() } else { r.body() };
        out.push_str(&body);
        out.push_str(&r.trailing);
    }
    out
}

impl Resource {
    /// Same resource, emitted as YAML.
    pub fn into_yaml(mut self) -> Resource {
        self.format = Format::Yaml;
        self.raw = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpt_core::ErrorKind;

    const DEPLOY: &str = "# Deployment for the web tier\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web # keep short\n  namespace: prod\nspec:\n  replicas: 3\n  template:\n    spec:\n      containers:\n        - name: app\n          image: 'nginx:1.25'\n";

    #[test]
    fn untouched_documents_round_trip_bit_for_bit() {
        let src = format!("{}---\n# second\napiVersion: v1\nkind: ConfigMap\nmetadata: {{name: cfg}}\ndata:\n  k: \"v\"\n", DEPLOY);
        let docs = parse_stream(&src).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(serialize_stream(&docs), src);
    }

    #[test]
    fn annotate_then_strip_restores_raw() {
        let mut docs = parse_stream(DEPLOY).unwrap();
        let r = &mut docs[0];
        r.set_location("deploy.yaml", 0);
        assert_eq!(r.path_annotation(), Some("deploy.yaml"));
        assert_eq!(r.index_annotation(), Some(0));
        assert!(!r.is_pristine());
        r.strip_internal_annotations();
        assert!(r.is_pristine());
        assert_eq!(r.body(), DEPLOY);
    }

    #[test]
    fn edits_keep_comments_and_indentation() {
        let mut docs = parse_stream(DEPLOY).unwrap();
        docs[0].root_mut().path_set("spec.replicas", Node::from(5i64)).unwrap();
        let out = docs[0].body();
        assert_eq!(out, DEPLOY.replace("replicas: 3", "replicas: 5"));
        let again = parse_stream(&out).unwrap();
        assert_eq!(again[0].root(), docs[0].root());
    }

    #[test]
    fn identity_and_metadata_accessors() {
        let docs = parse_stream(DEPLOY).unwrap();
        let r = &docs[0];
        assert_eq!(r.identity(), ResId::new("apps", "Deployment", Some("prod"), "web"));
        assert!(!r.is_local_config());
        let mut cm = Resource::new("v1", "ConfigMap", "x");
        cm.set_annotation(LOCAL_CONFIG_ANNOTATION, "true");
        cm.set_label("app", "web");
        assert!(cm.is_local_config());
        assert_eq!(cm.labels().get("app").map(String::as_str), Some("web"));
        assert_eq!(cm.identity().namespace, None);
        cm.remove_annotation(LOCAL_CONFIG_ANNOTATION);
        cm.strip_internal_annotations();
        assert!(cm.root().get("metadata").unwrap().get("annotations").is_none());
    }

    #[test]
    fn legacy_location_annotations_are_read() {
        let src = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n  annotations:\n    config.kubernetes.io/path: a/b.yaml\n    config.kubernetes.io/index: '2'\n";
        let docs = parse_stream(src).unwrap();
        assert_eq!(docs[0].path_annotation(), Some("a/b.yaml"));
        assert_eq!(docs[0].index_annotation(), Some(2));
    }

    #[test]
    fn empty_documents_are_dropped() {
        let src = "---\n# just a comment\n---\napiVersion: v1\nkind: A\nmetadata:\n  name: a\n---\n";
        let docs = parse_stream(src).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(serialize_stream(&docs), src);
    }

    #[test]
    fn malformed_input_is_parse_error_with_offset() {
        let err = parse_stream("a: 1\n---\nb: [\n").unwrap_err();
        assert!(err.is(ErrorKind::ParseError));
        assert!(err.offset().is_some());
        let err = parse_json("{\n  \"a\": ,\n}").unwrap_err();
        assert!(err.is(ErrorKind::ParseError));
        assert!(matches!(err.offset(), Some(o) if (2..12).contains(&o)));
    }

    #[test]
    fn json_files_stay_json() {
        let docs = parse_file("cm.json", "{\"apiVersion\":\"v1\",\"kind\":\"ConfigMap\",\"metadata\":{\"name\":\"j\"}}").unwrap();
        assert_eq!(docs[0].format(), Format::Json);
        let out = serialize_stream(&docs);
        assert!(out.starts_with("{\n  \"apiVersion\": \"v1\""));
    }
}
