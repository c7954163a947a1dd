use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a resource: `(group, kind, namespace, name)`.
///
/// The version is deliberately excluded so that a resource keeps its identity
/// across API version bumps. This is also the element type stored in a
/// ResourceGroup inventory's `spec.resources`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ResId {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResId {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.filter(|n| !n.is_empty()).map(|n| n.to_string()),
            name: name.into(),
        }
    }

    /// Builds an identity from an `apiVersion` string (`group/version` or `version`).
    pub fn from_api_version(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self::new(group_of(api_version), kind, namespace, name)
    }

    pub fn namespace_str(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

/// Group component of an `apiVersion`; core resources have an empty group.
pub fn group_of(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((g, _)) => g,
        None => "",
    }
}

impl fmt::Display for ResId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gk = if self.group.is_empty() { self.kind.clone() } else { format!("{}.{}", self.kind, self.group) };
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", gk, ns, self.name),
            None => write!(f, "{}/{}", gk, self.name),
        }
    }
}
