//! Block-style YAML emitter honoring [`Meta`] comments and scalar styles.

use crate::node::{Meta, Node, Scalar, Style, Value};

#[derive(Debug, Clone, Copy)]
pub struct EmitOptions {
    /// Columns between a key and its nested mapping keys.
    pub indent: usize,
    /// Columns between a key and the `-` of its block sequence.
    pub seq_offset: usize,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self { indent: 2, seq_offset: 0 }
    }
}

pub fn emit(root: &Node, foot: &[String], opts: EmitOptions) -> String {
    let mut e = Emitter { out: String::new(), opts };
    for c in &root.meta.head {
        e.out.push_str(c);
        e.out.push('\n');
    }
    match &root.value {
        Value::Mapping(m) if !m.is_empty() && root.meta.style != Style::Flow => e.entries(m, 0),
        Value::Sequence(s) if !s.is_empty() && root.meta.style != Style::Flow => e.items(s, 0),
        _ => {
            let text = e.inline(root, 0);
            e.out.push_str(&text);
            e.line_comment(&root.meta);
            e.out.push('\n');
        }
    }
    for c in foot {
        e.out.push_str(c);
        e.out.push('\n');
    }
    e.out
}

struct Emitter {
    out: String,
    opts: EmitOptions,
}

fn pad(n: usize) -> String {
    " ".repeat(n)
}

impl Emitter {
    fn heads(&mut self, meta: &Meta, indent: usize) {
        for c in &meta.head {
            self.out.push_str(&pad(indent));
            self.out.push_str(c);
            self.out.push('\n');
        }
    }

    fn line_comment(&mut self, meta: &Meta) {
        if let Some(c) = &meta.line {
            self.out.push(' ');
            self.out.push_str(c);
        }
    }

    fn entries(&mut self, entries: &[(String, Node)], indent: usize) {
        for (k, v) in entries {
            self.heads(&v.meta, indent);
            self.out.push_str(&pad(indent));
            self.entry(k, v, indent);
        }
    }

    /// Writes `key: value` assuming the cursor is already at `indent`.
    fn entry(&mut self, key: &str, v: &Node, indent: usize) {
        self.out.push_str(&key_text(key));
        self.out.push(':');
        self.value_after(v, indent, indent + self.opts.indent);
    }

    /// Emits a value following `key:` or `-`; `child` is the indent for nested blocks.
    fn value_after(&mut self, v: &Node, indent: usize, child: usize) {
        match &v.value {
            Value::Mapping(m) if !m.is_empty() && v.meta.style != Style::Flow => {
                self.line_comment(&v.meta);
                self.out.push('\n');
                self.entries(m, child);
            }
            Value::Sequence(s) if !s.is_empty() && v.meta.style != Style::Flow => {
                self.line_comment(&v.meta);
                self.out.push('\n');
                self.items(s, indent + self.opts.seq_offset);
            }
            Value::Scalar(Scalar::Null) if v.meta.raw.is_none() => {
                self.line_comment(&v.meta);
                self.out.push('\n');
            }
            Value::Scalar(Scalar::Str(s)) if wants_block(s, v.meta.style) => {
                self.block_scalar(s, v, child);
            }
            _ => {
                self.out.push(' ');
                let text = self.inline(v, child);
                self.out.push_str(&text);
                self.line_comment(&v.meta);
                self.out.push('\n');
            }
        }
    }

    fn items(&mut self, items: &[Node], indent: usize) {
        for item in items {
            self.heads(&item.meta, indent);
            self.out.push_str(&pad(indent));
            self.out.push('-');
            match &item.value {
                Value::Mapping(m) if !m.is_empty() && item.meta.style != Style::Flow => {
                    let (k, v) = &m[0];
                    if !v.meta.head.is_empty() {
                        // Head comments of the first key cannot sit between `-` and the key.
                        self.out.push('\n');
                        self.entries(m, indent + 2);
                        continue;
                    }
                    self.out.push(' ');
                    self.entry(k, v, indent + 2);
                    self.entries(&m[1..], indent + 2);
                }
                Value::Sequence(s) if !s.is_empty() && item.meta.style != Style::Flow => {
                    self.line_comment(&item.meta);
                    self.out.push('\n');
                    self.items(s, indent + 2);
                }
                Value::Scalar(Scalar::Str(s)) if wants_block(s, item.meta.style) => {
                    self.block_scalar(s, item, indent + 2);
                }
                _ => {
                    self.out.push(' ');
                    let text = self.inline(item, indent + 2);
                    self.out.push_str(&text);
                    self.line_comment(&item.meta);
                    self.out.push('\n');
                }
            }
        }
    }

    fn block_scalar(&mut self, s: &str, v: &Node, indent: usize) {
        let chomp = if !s.ends_with('\n') {
            "-"
        } else if s.ends_with("\n\n") {
            "+"
        } else {
            ""
        };
        // Folded sources are re-emitted as literal blocks; the value is the same.
        self.out.push_str(" |");
        self.out.push_str(chomp);
        self.line_comment(&v.meta);
        self.out.push('\n');
        let body = if chomp == "+" { s.strip_suffix('\n').unwrap_or(s) } else { s.trim_end_matches('\n') };
        for line in body.split('\n') {
            if !line.is_empty() {
                self.out.push_str(&pad(indent));
                self.out.push_str(line);
            }
            self.out.push('\n');
        }
    }

    /// Single-line rendering of scalars, empty collections and flow collections.
    fn inline(&self, v: &Node, indent: usize) -> String {
        match &v.value {
            Value::Scalar(s) => scalar_text(s, &v.meta),
            Value::Mapping(m) if m.is_empty() => "{}".to_string(),
            Value::Sequence(s) if s.is_empty() => "[]".to_string(),
            _ => flow_text(v, indent),
        }
    }
}

/// Multi-line strings become literal blocks unless the first line starts with a
/// space, which would need an explicit indentation indicator.
fn wants_block(s: &str, style: Style) -> bool {
    let multiline = s.trim_end_matches('\n').contains('\n') || matches!(style, Style::Literal | Style::Folded);
    multiline && !s.starts_with(' ') && !s.is_empty() && !s.contains('\t') && !s.contains('\r')
}

fn scalar_text(s: &Scalar, meta: &Meta) -> String {
    if let Some(raw) = &meta.raw {
        if meta.style == Style::Plain && raw_matches(raw, s) {
            return raw.clone();
        }
    }
    match s {
        Scalar::Null => "null".to_string(),
        Scalar::Bool(b) => b.to_string(),
        Scalar::Number(n) => n.to_string(),
        Scalar::Str(text) => match meta.style {
            Style::DoubleQuoted => double_quoted(text),
            Style::SingleQuoted if !text.contains('\n') => format!("'{}'", text.replace('\'', "''")),
            _ => plain_or_quoted(text),
        },
    }
}

fn raw_matches(raw: &str, s: &Scalar) -> bool {
    match serde_yaml::from_str::<serde_yaml::Value>(raw) {
        Ok(v) => match Node::from_yaml(&v).value {
            Value::Scalar(parsed) => &parsed == s,
            _ => false,
        },
        Err(_) => false,
    }
}

fn double_quoted(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

fn plain_or_quoted(s: &str) -> String {
    match serde_yaml::to_string(&serde_yaml::Value::String(s.to_string())) {
        Ok(out) if !out.trim_end().contains('\n') => out.trim_end().to_string(),
        _ => double_quoted(s),
    }
}

pub(crate) fn key_text(k: &str) -> String {
    if !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c)) {
        let quoted = plain_or_quoted(k);
        if quoted == k {
            return quoted;
        }
    }
    double_quoted(k)
}

fn flow_safe(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(|c| ",[]{}#:'\"\n".contains(c)) && plain_or_quoted(s) == s
}

fn flow_text(v: &Node, indent: usize) -> String {
    match &v.value {
        Value::Scalar(Scalar::Str(s)) => {
            if flow_safe(s) {
                s.clone()
            } else {
                double_quoted(s)
            }
        }
        Value::Scalar(s) => scalar_text(s, &v.meta),
        Value::Sequence(items) => {
            let parts: Vec<String> = items.iter().map(|i| flow_text(i, indent)).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Mapping(m) => {
            let parts: Vec<String> = m.iter().map(|(k, v)| format!("{}: {}", key_text(k), flow_text(v, indent))).collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}
