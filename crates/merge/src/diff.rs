//! Unified diffs between file sets.

use kpt_core::{Error, Result};
use kpt_pkg::FileSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub kind: DiffKind,
    /// Unified diff; the whole new content for added files.
    pub patch: String,
}

/// Unified diff of `old` and `new` with `a/` and `b/` headers. Empty when
/// the texts are equal.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    let text = diffy::create_patch(old, new).to_string();
    // diffy writes `--- original` / `+++ modified`; use the file path instead.
    let hunks = text.splitn(3, '\n').nth(2).unwrap_or("");
    format!("--- a/{}\n+++ b/{}\n{}", path, path, hunks)
}

fn text(bytes: &[u8]) -> Option<&str> {
    std::str::from_utf8(bytes).ok()
}

/// Per-file differences going from `a` to `b`, in path order.
pub fn diff_packages(a: &FileSet, b: &FileSet) -> Vec<FileDiff> {
    let mut out = Vec::new();
    for (path, old) in a.iter() {
        match b.get(path) {
            None => out.push(FileDiff {
                path: path.to_string(),
                kind: DiffKind::Removed,
                patch: text(old).map(|t| unified_diff(path, t, "")).unwrap_or_default(),
            }),
            Some(new) if new != old => {
                let patch = match (text(old), text(new)) {
                    (Some(o), Some(n)) => unified_diff(path, o, n),
                    _ => format!("Binary files a/{} and b/{} differ\n", path, path),
                };
                out.push(FileDiff { path: path.to_string(), kind: DiffKind::Modified, patch });
            }
            Some(_) => {}
        }
    }
    for (path, new) in b.iter().filter(|(p, _)| !a.contains(p)) {
        out.push(FileDiff {
            path: path.to_string(),
            kind: DiffKind::Added,
            patch: String::from_utf8_lossy(new).into_owned(),
        });
    }
    out.sort_by(|x, y| x.path.cmp(&y.path));
    out
}

/// Applies a unified diff produced by [`unified_diff`] to `old`.
pub fn apply_patch(old: &str, patch: &str) -> Result<String> {
    if patch.is_empty() {
        return Ok(old.to_string());
    }
    let parsed = diffy::Patch::from_str(patch)
        .map_err(|e| Error::parse(format!("bad patch: {}", e)).with_op("diff.apply"))?;
    diffy::apply(old, &parsed).map_err(|e| Error::conflicting_edits(format!("patch does not apply: {}", e), Vec::new()).with_op("diff.apply"))
}

/// Three-way text merge; `Err` carries the conflicted text with markers.
pub fn merge_text(origin: &str, updated: &str, local: &str) -> std::result::Result<String, String> {
    diffy::merge(origin, local, updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_then_apply_reproduces_new_text() {
        let old = "a: 1\nb: 2\nc: 3\n";
        let new = "a: 1\nb: 20\nc: 3\nd: 4\n";
        let patch = unified_diff("x.yaml", old, new);
        assert!(patch.starts_with("--- a/x.yaml\n+++ b/x.yaml\n@@"));
        assert!(patch.contains("-b: 2\n+b: 20\n"));
        assert_eq!(apply_patch(old, &patch).unwrap(), new);
        assert_eq!(unified_diff("x", old, old), "");
    }

    #[test]
    fn stale_patch_fails() {
        let patch = unified_diff("x", "a\nb\n", "a\nc\n");
        let err = apply_patch("zzz\n", &patch).unwrap_err();
        assert!(err.is(kpt_core::ErrorKind::ConflictingEdits));
    }

    #[test]
    fn package_diff_kinds() {
        let mut a = FileSet::new();
        a.insert("same", "x");
        a.insert("gone", "x\n");
        a.insert("changed", "1\n");
        let mut b = FileSet::new();
        b.insert("same", "x");
        b.insert("changed", "2\n");
        b.insert("new", "n\n");
        let d = diff_packages(&a, &b);
        let kinds: Vec<(&str, DiffKind)> = d.iter().map(|f| (f.path.as_str(), f.kind)).collect();
        assert_eq!(kinds, vec![("changed", DiffKind::Modified), ("gone", DiffKind::Removed), ("new", DiffKind::Added)]);
        assert_eq!(d[2].patch, "n\n");
    }

    #[test]
    fn text_merge_combines_disjoint_edits() {
        let merged = merge_text("a\nb\nc\n", "A\nb\nc\n", "a\nb\nC\n").unwrap();
        assert_eq!(merged, "A\nb\nC\n");
        assert!(merge_text("a\n", "b\n", "c\n").is_err());
    }
}
