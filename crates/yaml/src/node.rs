//! Node tree with formatting metadata.
//!
//! Equality on [`Node`] compares values only, and mapping equality ignores key
//! order. Use [`Node::identical`] to also compare comments, styles and order.

use std::fmt;

/// Presentation style of a node as it appeared in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Style {
    #[default]
    Plain,
    SingleQuoted,
    DoubleQuoted,
    Literal,
    Folded,
    Flow,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Meta {
    /// Comment lines directly above the node (or its key), including `#`.
    pub head: Vec<String>,
    /// Trailing comment on the node's line, including `#`.
    pub line: Option<String>,
    pub style: Style,
    /// Original text of a plain scalar, kept so `0x1F` or `yes` survive re-emission.
    pub raw: Option<String>,
}

impl Meta {
    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.line.is_none() && self.style == Style::Plain && self.raw.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(serde_yaml::Number),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Number(n) => write!(f, "{}", n),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Scalar(Scalar),
    Mapping(Vec<(String, Node)>),
    Sequence(Vec<Node>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            (Value::Mapping(a), Value::Mapping(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.iter().find(|(bk, _)| bk == k).map(|(_, bv)| bv == v).unwrap_or(false))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub value: Value,
    pub meta: Meta,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::null()
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        Node { value, meta: Meta::default() }
    }
}

impl From<&str> for Node {
    fn from(s: &str) -> Self {
        Node::string(s)
    }
}

impl From<String> for Node {
    fn from(s: String) -> Self {
        Node::string(s)
    }
}

impl From<bool> for Node {
    fn from(b: bool) -> Self {
        Node::from(Value::Scalar(Scalar::Bool(b)))
    }
}

impl From<i64> for Node {
    fn from(n: i64) -> Self {
        Node::from(Value::Scalar(Scalar::Number(n.into())))
    }
}

impl Node {
    pub fn null() -> Self {
        Node::from(Value::Scalar(Scalar::Null))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Node::from(Value::Scalar(Scalar::Str(s.into())))
    }

    pub fn mapping() -> Self {
        Node::from(Value::Mapping(Vec::new()))
    }

    pub fn sequence(items: Vec<Node>) -> Self {
        Node::from(Value::Sequence(items))
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Scalar(Scalar::Null))
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self.value, Value::Mapping(_))
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.value, Value::Sequence(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.value, Value::Scalar(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.value {
            Value::Scalar(Scalar::Null) => "null",
            Value::Scalar(_) => "scalar",
            Value::Mapping(_) => "mapping",
            Value::Sequence(_) => "sequence",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::Scalar(Scalar::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            Value::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &self.value {
            Value::Scalar(Scalar::Number(n)) => n.as_i64(),
            _ => None,
        }
    }

    /// Any non-null scalar rendered as text; used for associative-key matching.
    pub fn scalar_string(&self) -> Option<String> {
        match &self.value {
            Value::Scalar(Scalar::Null) => None,
            Value::Scalar(s) => Some(s.to_string()),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Vec<(String, Node)>> {
        match &self.value {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut Vec<(String, Node)>> {
        match &mut self.value {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Vec<Node>> {
        match &self.value {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence_mut(&mut self) -> Option<&mut Vec<Node>> {
        match &mut self.value {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_mapping()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.as_mapping_mut()?.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Node::as_str)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.as_mapping().map(|m| m.iter().map(|(k, _)| k.as_str()).collect()).unwrap_or_default()
    }

    /// Inserts or replaces a mapping entry. A null node becomes an empty mapping
    /// first. Replacing keeps the entry's position and, when the new node has
    /// no comments of its own, the old comments.
    pub fn set(&mut self, key: &str, mut value: Node) {
        if self.is_null() {
            self.value = Value::Mapping(Vec::new());
        }
        let Some(m) = self.as_mapping_mut() else { return };
        if let Some((_, slot)) = m.iter_mut().find(|(k, _)| k == key) {
            if value.meta.head.is_empty() && value.meta.line.is_none() {
                value.meta.head = std::mem::take(&mut slot.meta.head);
                value.meta.line = slot.meta.line.take();
            }
            *slot = value;
        } else {
            m.push((key.to_string(), value));
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        let m = self.as_mapping_mut()?;
        let idx = m.iter().position(|(k, _)| k == key)?;
        Some(m.remove(idx).1)
    }

    /// Returns the child mapping under `key`, creating it when absent or null.
    pub fn entry_mapping(&mut self, key: &str) -> Option<&mut Node> {
        let missing = self.get(key).map(|n| n.is_null()).unwrap_or(true);
        if missing {
            self.set(key, Node::mapping());
        }
        self.get_mut(key).filter(|n| n.is_mapping())
    }

    /// Structural equality that also compares comments, styles and key order.
    pub fn identical(&self, other: &Node) -> bool {
        if self.meta != other.meta {
            return false;
        }
        match (&self.value, &other.value) {
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.identical(y))
            }
            (Value::Mapping(a), Value::Mapping(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|((ka, va), (kb, vb))| ka == kb && va.identical(vb))
            }
            _ => false,
        }
    }

    /// Clears comments and styles throughout the subtree.
    pub fn strip_meta(&mut self) {
        self.meta = Meta::default();
        match &mut self.value {
            Value::Mapping(m) => m.iter_mut().for_each(|(_, v)| v.strip_meta()),
            Value::Sequence(s) => s.iter_mut().for_each(Node::strip_meta),
            Value::Scalar(_) => {}
        }
    }

    pub fn from_yaml(v: &serde_yaml::Value) -> Node {
        let value = match v {
            serde_yaml::Value::Null => Value::Scalar(Scalar::Null),
            serde_yaml::Value::Bool(b) => Value::Scalar(Scalar::Bool(*b)),
            serde_yaml::Value::Number(n) => Value::Scalar(Scalar::Number(n.clone())),
            serde_yaml::Value::String(s) => Value::Scalar(Scalar::Str(s.clone())),
            serde_yaml::Value::Sequence(items) => Value::Sequence(items.iter().map(Node::from_yaml).collect()),
            serde_yaml::Value::Mapping(m) => {
                Value::Mapping(m.iter().map(|(k, v)| (key_text(k), Node::from_yaml(v))).collect())
            }
            serde_yaml::Value::Tagged(t) => return Node::from_yaml(&t.value),
        };
        Node::from(value)
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match &self.value {
            Value::Scalar(Scalar::Null) => serde_yaml::Value::Null,
            Value::Scalar(Scalar::Bool(b)) => serde_yaml::Value::Bool(*b),
            Value::Scalar(Scalar::Number(n)) => serde_yaml::Value::Number(n.clone()),
            Value::Scalar(Scalar::Str(s)) => serde_yaml::Value::String(s.clone()),
            Value::Sequence(items) => serde_yaml::Value::Sequence(items.iter().map(Node::to_yaml).collect()),
            Value::Mapping(m) => {
                let mut out = serde_yaml::Mapping::new();
                for (k, v) in m {
                    out.insert(serde_yaml::Value::String(k.clone()), v.to_yaml());
                }
                serde_yaml::Value::Mapping(out)
            }
        }
    }

    pub fn from_json(v: &serde_json::Value) -> Node {
        let value = match v {
            serde_json::Value::Null => Value::Scalar(Scalar::Null),
            serde_json::Value::Bool(b) => Value::Scalar(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => Value::Scalar(Scalar::Number(json_number(n))),
            serde_json::Value::String(s) => Value::Scalar(Scalar::Str(s.clone())),
            serde_json::Value::Array(items) => Value::Sequence(items.iter().map(Node::from_json).collect()),
            serde_json::Value::Object(m) => Value::Mapping(m.iter().map(|(k, v)| (k.clone(), Node::from_json(v))).collect()),
        };
        Node::from(value)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.value {
            Value::Scalar(Scalar::Null) => serde_json::Value::Null,
            Value::Scalar(Scalar::Bool(b)) => serde_json::Value::Bool(*b),
            Value::Scalar(Scalar::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    i.into()
                } else if let Some(u) = n.as_u64() {
                    u.into()
                } else {
                    n.as_f64()
                        .and_then(serde_json::Number::from_f64)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::Scalar(Scalar::Str(s)) => serde_json::Value::String(s.clone()),
            Value::Sequence(items) => serde_json::Value::Array(items.iter().map(Node::to_json).collect()),
            Value::Mapping(m) => {
                let mut out = serde_json::Map::new();
                for (k, v) in m {
                    out.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(out)
            }
        }
    }

    /// Deserializes the subtree into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> kpt_core::Result<T> {
        Ok(serde_yaml::from_value(self.to_yaml())?)
    }

    pub fn encode<T: serde::Serialize>(value: &T) -> kpt_core::Result<Node> {
        Ok(Node::from_yaml(&serde_yaml::to_value(value)?))
    }
}

fn json_number(n: &serde_json::Number) -> serde_yaml::Number {
    if let Some(i) = n.as_i64() {
        i.into()
    } else if let Some(u) = n.as_u64() {
        u.into()
    } else {
        n.as_f64().unwrap_or(0.0).into()
    }
}

pub(crate) fn key_text(k: &serde_yaml::Value) -> String {
    match k {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Null => "null".to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other).map(|s| s.trim_end().to_string()).unwrap_or_default(),
    }
}
