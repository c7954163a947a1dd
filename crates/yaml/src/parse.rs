//! Multi-document stream splitting and node construction.

use std::collections::HashMap;

use kpt_core::{Error, Result};

use crate::node::{Meta, Node, Value};
use crate::scan::{scan, Scan, Seg};

/// One document of a stream, with the separator and comment-only text that
/// preceded it.
#[derive(Debug, Clone)]
pub(crate) struct Chunk<'a> {
    pub leading: String,
    pub body: &'a str,
    pub offset: usize,
}

fn is_separator(line: &str) -> bool {
    let t = line.trim_end();
    t == "---" || t.starts_with("--- ") || t.starts_with("---\t")
}

fn is_end_marker(line: &str) -> bool {
    line.trim_end() == "..."
}

/// Splits at `---` lines. Separator lines are kept in `leading` so untouched
/// documents can be written back verbatim.
pub(crate) fn split(src: &str) -> Vec<Chunk<'_>> {
    let mut chunks = Vec::new();
    let mut leading = String::new();
    let mut start = 0;
    let mut pos = 0;
    for line in src.split_inclusive('\n') {
        if is_separator(line) || is_end_marker(line) {
            chunks.push(Chunk { leading: std::mem::take(&mut leading), body: &src[start..pos], offset: start });
            leading.push_str(line);
            start = pos + line.len();
        }
        pos += line.len();
    }
    chunks.push(Chunk { leading, body: &src[start..], offset: start });
    chunks
}

/// A parsed document plus the formatting the scanner recovered for it.
pub(crate) struct Parsed {
    pub root: Node,
    pub foot: Vec<String>,
    pub seq_offset: Option<usize>,
    pub map_indent: Option<usize>,
}

pub(crate) fn parse_document(body: &str, offset: usize) -> Result<Option<Parsed>> {
    let value: serde_yaml::Value = serde_yaml::from_str(body).map_err(|e| Error::from(e).shift_offset(offset))?;
    if value.is_null() {
        return Ok(None);
    }
    let mut root = Node::from_yaml(&value);
    let Scan { metas, foot, seq_offset, map_indent } = scan(body);
    let mut path = Vec::new();
    attach(&mut root, &mut path, &metas);
    Ok(Some(Parsed { root, foot, seq_offset, map_indent }))
}

fn attach(node: &mut Node, path: &mut Vec<Seg>, metas: &HashMap<Vec<Seg>, Meta>) {
    if let Some(m) = metas.get(path.as_slice()) {
        node.meta = m.clone();
        if !node.is_scalar() {
            node.meta.raw = None;
        }
    }
    match &mut node.value {
        Value::Mapping(entries) => {
            for (k, v) in entries.iter_mut() {
                path.push(Seg::Key(k.clone()));
                attach(v, path, metas);
                path.pop();
            }
        }
        Value::Sequence(items) => {
            for (i, v) in items.iter_mut().enumerate() {
                path.push(Seg::Index(i));
                attach(v, path, metas);
                path.pop();
            }
        }
        Value::Scalar(_) => {}
    }
}
