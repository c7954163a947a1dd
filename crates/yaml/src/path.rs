//! Path expressions: `a.b[0].c`, `spec.containers[name=app].image`, `data.*`.
//!
//! Segments are dot-separated; `\.` escapes a literal dot inside a field name.

use kpt_core::{Error, Result};

use crate::node::{Node, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Field(String),
    Index(usize),
    Match { key: String, value: String },
    Wildcard,
}

pub fn parse_path(expr: &str) -> Result<Vec<Step>> {
    let bad = |why: &str| Error::invalid_param(format!("path {:?}: {}", expr, why)).with_op("path.parse");
    if expr.is_empty() {
        return Err(bad("empty expression"));
    }
    let mut steps = Vec::new();
    for segment in split_segments(expr) {
        let segment = segment.map_err(|why| bad(why))?;
        if segment.is_empty() {
            return Err(bad("empty segment"));
        }
        if segment == "*" {
            steps.push(Step::Wildcard);
            continue;
        }
        let (field, mut rest) = match find_unescaped(&segment, '[') {
            Some(i) => (&segment[..i], &segment[i..]),
            None => (segment.as_str(), ""),
        };
        if !field.is_empty() {
            steps.push(Step::Field(unescape(field)));
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| bad("unterminated '['"))?;
            let inner = &rest[1..close];
            if let Ok(i) = inner.parse::<usize>() {
                steps.push(Step::Index(i));
            } else if let Some((k, v)) = inner.split_once('=') {
                if k.is_empty() {
                    return Err(bad("empty key in [key=value]"));
                }
                steps.push(Step::Match { key: unescape(k), value: unescape(v) });
            } else if inner == "*" {
                steps.push(Step::Wildcard);
            } else {
                return Err(bad("brackets must hold an index or key=value"));
            }
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return Err(bad("unexpected text after ']'"));
            }
        }
    }
    Ok(steps)
}

fn split_segments(expr: &str) -> Vec<std::result::Result<String, &'static str>> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut depth = 0;
    let mut chars = expr.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                cur.push('\\');
                if let Some(n) = chars.next() {
                    cur.push(n);
                }
            }
            '[' => {
                depth += 1;
                cur.push(c);
            }
            ']' => {
                if depth == 0 {
                    out.push(Err("unbalanced ']'"));
                }
                depth -= 1;
                cur.push(c);
            }
            '.' if depth == 0 => out.push(Ok(std::mem::take(&mut cur))),
            _ => cur.push(c),
        }
    }
    if depth > 0 {
        out.push(Err("unterminated '['"));
    }
    out.push(Ok(cur));
    out
}

fn find_unescaped(s: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn unescape(s: &str) -> String {
    s.replace("\\.", ".")
}

fn matches_item(item: &Node, key: &str, value: &str) -> bool {
    item.get(key).and_then(Node::scalar_string).map(|v| v == value).unwrap_or(false)
}

fn collect<'a>(node: &'a Node, steps: &[Step], out: &mut Vec<&'a Node>) {
    let Some((step, rest)) = steps.split_first() else {
        out.push(node);
        return;
    };
    match (step, &node.value) {
        (Step::Field(f), Value::Mapping(_)) => {
            if let Some(child) = node.get(f) {
                collect(child, rest, out);
            }
        }
        (Step::Index(i), Value::Sequence(items)) => {
            if let Some(child) = items.get(*i) {
                collect(child, rest, out);
            }
        }
        (Step::Match { key, value }, Value::Sequence(items)) => {
            for item in items.iter().filter(|i| matches_item(i, key, value)) {
                collect(item, rest, out);
            }
        }
        (Step::Wildcard, Value::Mapping(m)) => m.iter().for_each(|(_, v)| collect(v, rest, out)),
        (Step::Wildcard, Value::Sequence(items)) => items.iter().for_each(|v| collect(v, rest, out)),
        _ => {}
    }
}

fn set_in(node: &mut Node, steps: &[Step], value: Node, expr: &str) -> Result<()> {
    let Some((step, rest)) = steps.split_first() else {
        let mut value = value;
        if value.meta.head.is_empty() && value.meta.line.is_none() {
            value.meta.head = std::mem::take(&mut node.meta.head);
            value.meta.line = node.meta.line.take();
        }
        *node = value;
        return Ok(());
    };
    match step {
        Step::Field(f) => {
            if node.is_null() {
                node.value = Value::Mapping(Vec::new());
            }
            if !node.is_mapping() {
                return Err(mismatch(expr, "a mapping", node));
            }
            if node.get(f).is_none() {
                node.set(f, Node::null());
            }
            match node.get_mut(f) {
                Some(child) => set_in(child, rest, value, expr),
                None => Err(Error::internal("mapping entry vanished").with_op("path.set")),
            }
        }
        Step::Index(i) => match &mut node.value {
            Value::Sequence(items) => match items.get_mut(*i) {
                Some(child) => set_in(child, rest, value, expr),
                None => Err(Error::path_not_found(format!("path {:?}: index {} out of range", expr, i)).with_op("path.set")),
            },
            _ => Err(mismatch(expr, "a sequence", node)),
        },
        Step::Match { key, value: want } => {
            if node.is_null() {
                node.value = Value::Sequence(Vec::new());
            }
            if !node.is_sequence() {
                return Err(mismatch(expr, "a sequence", node));
            }
            let Some(items) = node.as_sequence_mut() else { return Ok(()) };
            let idx = match items.iter().position(|i| matches_item(i, key, want)) {
                Some(idx) => idx,
                None => {
                    let mut fresh = Node::mapping();
                    fresh.set(key, Node::string(want.clone()));
                    items.push(fresh);
                    items.len() - 1
                }
            };
            set_in(&mut items[idx], rest, value, expr)
        }
        Step::Wildcard => {
            let children: Vec<&mut Node> = match &mut node.value {
                Value::Mapping(m) => m.iter_mut().map(|(_, v)| v).collect(),
                Value::Sequence(s) => s.iter_mut().collect(),
                Value::Scalar(_) => Vec::new(),
            };
            if children.is_empty() {
                return Err(Error::path_not_found(format!("path {:?}: wildcard matched nothing", expr)).with_op("path.set"));
            }
            for child in children {
                set_in(child, rest, value.clone(), expr)?;
            }
            Ok(())
        }
    }
}

fn mismatch(expr: &str, what: &str, found: &Node) -> Error {
    Error::invalid_param(format!("path {:?}: expected {} but found {}", expr, what, found.kind_name())).with_op("path.set")
}

impl Node {
    /// All nodes addressed by `expr`; wildcards and matches may yield several.
    pub fn path_lookup(&self, expr: &str) -> Result<Vec<&Node>> {
        let steps = parse_path(expr)?;
        let mut out = Vec::new();
        collect(self, &steps, &mut out);
        Ok(out)
    }

    pub fn path_get(&self, expr: &str) -> Result<Option<&Node>> {
        Ok(self.path_lookup(expr)?.into_iter().next())
    }

    /// Like [`Node::path_get`] but a miss is a `PathNotFound` error.
    pub fn path_get_strict(&self, expr: &str) -> Result<&Node> {
        self.path_get(expr)?
            .ok_or_else(|| Error::path_not_found(format!("no value at {:?}", expr)).with_op("path.get"))
    }

    /// Sets the value at `expr`, creating intermediate mappings and, for
    /// `[key=value]` steps, the matching sequence element.
    pub fn path_set(&mut self, expr: &str, value: Node) -> Result<()> {
        let steps = parse_path(expr)?;
        set_in(self, &steps, value, expr)
    }

    /// Removes the node(s) at `expr` and returns the first removed node.
    pub fn path_remove(&mut self, expr: &str) -> Result<Option<Node>> {
        let mut steps = parse_path(expr)?;
        let Some(last) = steps.pop() else { return Ok(None) };
        let mut parents = Vec::new();
        collect_mut(self, &steps, &mut parents);
        let mut first = None;
        for parent in parents {
            let removed = match (&last, &mut parent.value) {
                (Step::Field(f), Value::Mapping(_)) => parent.remove(f).into_iter().collect(),
                (Step::Index(i), Value::Sequence(items)) if *i < items.len() => vec![items.remove(*i)],
                (Step::Match { key, value }, Value::Sequence(items)) => {
                    let (gone, keep): (Vec<Node>, Vec<Node>) =
                        std::mem::take(items).into_iter().partition(|i| matches_item(i, key, value));
                    *items = keep;
                    gone
                }
                (Step::Wildcard, Value::Mapping(m)) => std::mem::take(m).into_iter().map(|(_, v)| v).collect(),
                (Step::Wildcard, Value::Sequence(items)) => std::mem::take(items),
                _ => Vec::new(),
            };
            if first.is_none() {
                first = removed.into_iter().next();
            }
        }
        Ok(first)
    }
}

fn collect_mut<'a>(node: &'a mut Node, steps: &[Step], out: &mut Vec<&'a mut Node>) {
    let Some((step, rest)) = steps.split_first() else {
        out.push(node);
        return;
    };
    match (step, &mut node.value) {
        (Step::Field(f), Value::Mapping(m)) => {
            if let Some((_, child)) = m.iter_mut().find(|(k, _)| k == f) {
                collect_mut(child, rest, out);
            }
        }
        (Step::Index(i), Value::Sequence(items)) => {
            if let Some(child) = items.get_mut(*i) {
                collect_mut(child, rest, out);
            }
        }
        (Step::Match { key, value }, Value::Sequence(items)) => {
            for item in items.iter_mut().filter(|i| matches_item(i, key, value)) {
                collect_mut(item, rest, out);
            }
        }
        (Step::Wildcard, Value::Mapping(m)) => m.iter_mut().for_each(|(_, v)| collect_mut(v, rest, out)),
        (Step::Wildcard, Value::Sequence(items)) => items.iter_mut().for_each(|v| collect_mut(v, rest, out)),
        _ => {}
    }
}
