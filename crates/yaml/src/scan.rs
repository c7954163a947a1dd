//! Line scanner recovering what a value-level YAML parser drops: comments,
//! scalar styles, plain-scalar source text and sequence indentation.
//!
//! The scanner only understands block structure well enough to compute the
//! path of each key and sequence item. Everything it cannot place is ignored,
//! so a malformed document degrades to missing comments, never to an error.

use std::collections::HashMap;

use crate::node::{Meta, Style};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Seg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub metas: HashMap<Vec<Seg>, Meta>,
    /// Comments after the last node of the document.
    pub foot: Vec<String>,
    /// Columns between a key and the `-` of its block sequence (0 is compact).
    pub seq_offset: Option<usize>,
    /// Columns between a key and its nested mapping keys.
    pub map_indent: Option<usize>,
}

struct Frame {
    col: usize,
    path: Vec<Seg>,
    dash: bool,
}

#[derive(Default)]
struct Scanner {
    out: Scan,
    stack: Vec<Frame>,
    counters: HashMap<Vec<Seg>, usize>,
    pending: Vec<String>,
    block_parent: Option<usize>,
    flow_depth: i32,
}

pub(crate) fn scan(src: &str) -> Scan {
    let mut s = Scanner::default();
    for line in src.lines() {
        s.line(line);
    }
    s.out.foot = std::mem::take(&mut s.pending);
    s.out
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

impl Scanner {
    fn line(&mut self, line: &str) {
        let line = line.trim_end();
        if let Some(parent) = self.block_parent {
            if line.is_empty() || indent_of(line) > parent {
                return;
            }
            self.block_parent = None;
        }
        if self.flow_depth > 0 {
            self.flow_depth += bracket_delta(line);
            return;
        }
        let content = line.trim_start();
        if content.is_empty() {
            return;
        }
        if content.starts_with('#') {
            self.pending.push(content.to_string());
            return;
        }
        if content == "---" || content.starts_with("--- ") || content == "..." || content.starts_with('%') {
            return;
        }
        self.content(indent_of(line), content);
    }

    fn meta(&mut self, path: &[Seg]) -> &mut Meta {
        self.out.metas.entry(path.to_vec()).or_default()
    }

    fn content(&mut self, col: usize, content: &str) {
        if content == "-" || content.starts_with("- ") {
            self.dash(col, content);
            return;
        }
        let Some((key, after)) = split_key(content) else { return };
        while self.stack.last().map(|f| f.col >= col).unwrap_or(false) {
            self.stack.pop();
        }
        if self.out.map_indent.is_none() {
            if let Some(top) = self.stack.last().filter(|f| !f.dash && col > f.col) {
                self.out.map_indent = Some(col - top.col);
            }
        }
        let mut path = self.stack.last().map(|f| f.path.clone()).unwrap_or_default();
        path.push(Seg::Key(key));
        let head = std::mem::take(&mut self.pending);
        self.meta(&path).head = head;
        self.stack.push(Frame { col, path: path.clone(), dash: false });
        self.tail(&path, col, after);
    }

    fn dash(&mut self, col: usize, content: &str) {
        while self.stack.last().map(|f| f.col > col || (f.col == col && f.dash)).unwrap_or(false) {
            self.stack.pop();
        }
        if self.out.seq_offset.is_none() {
            if let Some(top) = self.stack.last().filter(|f| !f.dash) {
                self.out.seq_offset = Some(col.saturating_sub(top.col));
            }
        }
        let parent = self.stack.last().map(|f| f.path.clone()).unwrap_or_default();
        let counter = self.counters.entry(parent.clone()).or_insert(0);
        let idx = *counter;
        *counter += 1;
        let mut path = parent;
        path.push(Seg::Index(idx));
        let head = std::mem::take(&mut self.pending);
        self.meta(&path).head = head;
        self.stack.push(Frame { col, path: path.clone(), dash: true });

        let rest = content[1..].trim_start();
        if rest.is_empty() {
            return;
        }
        let rest_col = col + (content.len() - rest.len());
        if rest.starts_with('-') && (rest == "-" || rest.starts_with("- ")) {
            self.dash(rest_col, rest);
        } else if split_key(rest).is_some() {
            self.content(rest_col, rest);
        } else {
            self.tail(&path, col, rest);
        }
    }

    /// Handles the text after `key:` or `- ` for the node at `path`.
    fn tail(&mut self, path: &[Seg], col: usize, after: &str) {
        let after = after.trim();
        if after.is_empty() {
            return;
        }
        let first = after.as_bytes()[0];
        match first {
            b'#' => self.meta(path).line = Some(after.to_string()),
            b'|' | b'>' => {
                let m = self.meta(path);
                m.style = if first == b'|' { Style::Literal } else { Style::Folded };
                m.line = comment_after(after, 1);
                self.block_parent = Some(col);
            }
            b'\'' | b'"' => {
                let end = closing_quote(after).unwrap_or(after.len());
                let m = self.meta(path);
                m.style = if first == b'\'' { Style::SingleQuoted } else { Style::DoubleQuoted };
                m.line = comment_after(after, end);
            }
            b'[' | b'{' => {
                let delta = bracket_delta(after);
                self.meta(path).style = Style::Flow;
                if delta > 0 {
                    self.flow_depth = delta;
                } else {
                    let end = flow_end(after);
                    self.meta(path).line = comment_after(after, end);
                }
            }
            b'&' | b'!' => {
                let rest = after.split_once(' ').map(|(_, r)| r).unwrap_or("");
                self.tail(path, col, rest);
            }
            _ => {
                let (raw, comment) = match after.find(" #") {
                    Some(i) => (after[..i].trim_end(), Some(after[i + 1..].to_string())),
                    None => (after, None),
                };
                let m = self.meta(path);
                m.raw = Some(raw.to_string());
                m.line = comment;
            }
        }
    }
}

/// Splits `key: rest` and returns the decoded key plus the text after the colon.
pub(crate) fn split_key(content: &str) -> Option<(String, &str)> {
    let first = *content.as_bytes().first()?;
    let (key, after) = match first {
        b'"' | b'\'' => {
            let end = closing_quote(content)?;
            let rest = content[end..].trim_start();
            let rest = rest.strip_prefix(':')?;
            if !(rest.is_empty() || rest.starts_with(' ')) {
                return None;
            }
            let key: String = serde_yaml::from_str(&content[..end]).ok()?;
            (key, rest)
        }
        b'[' | b'{' | b'?' | b'|' | b'>' | b'#' | b'*' | b'&' | b'!' | b'%' | b'@' | b'`' => return None,
        _ => {
            let bytes = content.as_bytes();
            let mut found = None;
            for i in 0..bytes.len() {
                if bytes[i] == b'#' && i > 0 && bytes[i - 1] == b' ' {
                    return None;
                }
                if bytes[i] == b':' && (i + 1 == bytes.len() || bytes[i + 1] == b' ') {
                    found = Some(i);
                    break;
                }
            }
            let i = found?;
            (content[..i].trim_end().to_string(), &content[i + 1..])
        }
    };
    Some((key, after))
}

/// Byte index just past the closing quote of a quoted scalar starting at 0.
fn closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let q = *bytes.first()?;
    let mut i = 1;
    while i < bytes.len() {
        let b = bytes[i];
        if q == b'"' && b == b'\\' {
            i += 2;
            continue;
        }
        if b == q {
            if q == b'\'' && bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

fn comment_after(s: &str, from: usize) -> Option<String> {
    let rest = s.get(from..)?;
    let i = rest.find('#')?;
    Some(rest[i..].to_string())
}

fn bracket_delta(s: &str) -> i32 {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    let mut prev = ' ';
    for c in s.chars() {
        match quote {
            Some(q) => {
                if c == q && prev != '\\' {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' | '{' => depth += 1,
                ']' | '}' => depth -= 1,
                '#' if prev == ' ' => break,
                _ => {}
            },
        }
        prev = c;
    }
    depth
}

fn flow_end(s: &str) -> usize {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '[' | '{' => depth += 1,
                ']' | '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return i + 1;
                    }
                }
                _ => {}
            },
        }
    }
    s.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &[&str]) -> Vec<Seg> {
        path.iter()
            .map(|p| match p.parse::<usize>() {
                Ok(i) => Seg::Index(i),
                Err(_) => Seg::Key(p.to_string()),
            })
            .collect()
    }

    #[test]
    fn records_head_and_line_comments() {
        let src = "# top\napiVersion: v1 # inline\nmetadata:\n  # about name\n  name: x\n";
        let s = scan(src);
        assert_eq!(s.metas[&key(&["apiVersion"])].head, vec!["# top"]);
        assert_eq!(s.metas[&key(&["apiVersion"])].line.as_deref(), Some("# inline"));
        assert_eq!(s.metas[&key(&["apiVersion"])].raw.as_deref(), Some("v1"));
        assert_eq!(s.metas[&key(&["metadata", "name"])].head, vec!["# about name"]);
    }

    #[test]
    fn tracks_sequence_items_and_inline_keys() {
        let src = "spec:\n  containers:\n  # first\n  - name: a\n    image: x # pinned\n  - name: b\n";
        let s = scan(src);
        assert_eq!(s.seq_offset, Some(0));
        assert_eq!(s.map_indent, Some(2));
        assert_eq!(s.metas[&key(&["spec", "containers", "0"])].head, vec!["# first"]);
        assert_eq!(s.metas[&key(&["spec", "containers", "0", "image"])].line.as_deref(), Some("# pinned"));
        assert!(s.metas.contains_key(&key(&["spec", "containers", "1", "name"])));
    }

    #[test]
    fn styles_and_block_scalars() {
        let src = "a: 'q'\nb: \"d\"\nc: |\n  line one\n  key: not a key\nd: [1, 2]\ne: 0x1F\nf:\n    - x\n";
        let s = scan(src);
        assert_eq!(s.metas[&key(&["a"])].style, Style::SingleQuoted);
        assert_eq!(s.metas[&key(&["b"])].style, Style::DoubleQuoted);
        assert_eq!(s.metas[&key(&["c"])].style, Style::Literal);
        assert!(!s.metas.contains_key(&key(&["c", "key"])));
        assert!(!s.metas.contains_key(&key(&["key"])));
        assert_eq!(s.metas[&key(&["d"])].style, Style::Flow);
        assert_eq!(s.metas[&key(&["e"])].raw.as_deref(), Some("0x1F"));
        assert_eq!(s.seq_offset, Some(4));
    }

    #[test]
    fn quoted_keys_are_decoded() {
        assert_eq!(split_key("\"a.b\": 1").map(|(k, _)| k), Some("a.b".to_string()));
        assert_eq!(split_key("'it''s': x").map(|(k, _)| k), Some("it's".to_string()));
        assert!(split_key("http://x").is_none());
        assert!(split_key("plain # a: b").is_none());
    }

    #[test]
    fn foot_comments_are_collected() {
        let s = scan("a: 1\n# trailing\n");
        assert_eq!(s.foot, vec!["# trailing"]);
    }
}
