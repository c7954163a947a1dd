//! Package-level update strategies over whole file trees.
//!
//! Every strategy takes three trees rooted at the package directory:
//! `origin` (upstream at the locked revision), `updated` (upstream at the
//! new revision) and `local` (what is on disk), and returns the new local
//! tree. Nothing is written here.

use std::collections::BTreeSet;

use kpt_core::{Conflict, Error, Result, KPTFILE_NAME};
use kpt_pkg::io::krm_paths;
use kpt_pkg::{read_resources, write_resources, FileSet, ReadOptions, UpdateStrategy, MANIFEST_FILE};
use kpt_yaml::Resource;
use tracing::{debug, warn};

use crate::diff::{merge_text, unified_diff};
use crate::kptfile::{comparable, merge_kptfile, replace_keeping_inventory};
use crate::resource::merge_resources;

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub files: FileSet,
    /// Decisions the user should know about (kept subpackages, text
    /// conflicts resolved in favour of upstream).
    pub warnings: Vec<String>,
}

/// Runs `strategy` over the three trees.
pub fn merge_packages(strategy: UpdateStrategy, origin: &FileSet, updated: &FileSet, local: &FileSet) -> Result<MergeOutcome> {
    let outcome = match strategy {
        UpdateStrategy::ResourceMerge => resource_merge(origin, updated, local)?,
        UpdateStrategy::FastForward => fast_forward(origin, updated, local)?,
        UpdateStrategy::ForceDeleteReplace => MergeOutcome { files: replace_all(updated, local)?, warnings: Vec::new() },
        UpdateStrategy::CopyMerge => copy_merge(origin, updated, local)?,
    };
    debug!(%strategy, files = outcome.files.len(), warnings = outcome.warnings.len(), "merged package");
    Ok(outcome)
}

fn is_kptfile_path(path: &str) -> bool {
    path == KPTFILE_NAME || path.ends_with(&format!("/{}", KPTFILE_NAME))
}

fn parse_kptfile(files: &FileSet, path: &str) -> Result<Option<Resource>> {
    let Some(text) = files.get_str(path) else { return Ok(None) };
    let mut docs = kpt_yaml::parse_stream(text).map_err(|e| e.with_path(path).with_op("merge.kptfile"))?;
    if docs.is_empty() {
        return Ok(None);
    }
    let mut k = docs.remove(0);
    k.set_location(KPTFILE_NAME, 0);
    Ok(Some(k))
}

fn put(files: &mut FileSet, path: &str, r: &Resource) {
    files.insert(path, r.without_internal_annotations().body());
}

/// Differences between `origin` and `local` that a merge would overwrite.
/// Kptfile upstream, lock and inventory blocks, the write manifest and
/// subpackages fetched from their own upstream do not count.
pub fn local_edits(origin: &FileSet, local: &FileSet) -> Result<Vec<Conflict>> {
    let manifest = format!("/{}", MANIFEST_FILE);
    let mut skip = independent_subpackages(origin)?;
    skip.extend(independent_subpackages(local)?);
    let paths: BTreeSet<&str> = origin
        .paths()
        .chain(local.paths())
        .filter(|p| *p != MANIFEST_FILE && !p.ends_with(&manifest))
        .filter(|p| !skip.iter().any(|d| is_under(p, d)))
        .collect();
    let mut out = Vec::new();
    for path in paths {
        let (o, l) = (origin.get(path), local.get(path));
        if o == l {
            continue;
        }
        if is_kptfile_path(path) {
            if let (Some(ok), Some(lk)) = (parse_kptfile(origin, path)?, parse_kptfile(local, path)?) {
                if comparable(&ok) == comparable(&lk) {
                    continue;
                }
            }
        }
        let text = |b: Option<&[u8]>| b.map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
        out.push(Conflict { file: path.to_string(), diff: unified_diff(path, &text(o), &text(l)) });
    }
    Ok(out)
}

fn fast_forward(origin: &FileSet, updated: &FileSet, local: &FileSet) -> Result<MergeOutcome> {
    let conflicts = local_edits(origin, local)?;
    if !conflicts.is_empty() {
        let files: Vec<&str> = conflicts.iter().map(|c| c.file.as_str()).collect();
        return Err(Error::conflicting_edits(
            format!("local package has changes in {}; fast-forward refused", files.join(", ")),
            conflicts,
        )
        .with_op("merge.fast_forward"));
    }
    let mut files = replace_all(updated, local)?;
    for dir in independent_subpackages(local)? {
        files.remove_subtree(&dir);
        files.graft(&dir, &local.subtree(&dir));
    }
    Ok(MergeOutcome { files, warnings: Vec::new() })
}

/// `updated` verbatim, keeping only the root Kptfile's inventory from `local`.
fn replace_all(updated: &FileSet, local: &FileSet) -> Result<FileSet> {
    let mut out = updated.clone();
    if let Some(uk) = parse_kptfile(updated, KPTFILE_NAME)? {
        let lk = parse_kptfile(local, KPTFILE_NAME)?;
        let k = replace_keeping_inventory(&uk, lk.as_ref());
        if !k.root().identical(uk.root()) {
            put(&mut out, KPTFILE_NAME, &k);
        }
    }
    Ok(out)
}

fn copy_merge(origin: &FileSet, updated: &FileSet, local: &FileSet) -> Result<MergeOutcome> {
    let mut out = local.clone();
    for (path, bytes) in updated.iter() {
        if is_kptfile_path(path) && local.contains(path) {
            let (o, u, l) = (parse_kptfile(origin, path)?, parse_kptfile(updated, path)?, parse_kptfile(local, path)?);
            if let Some(k) = merge_kptfile(o.as_ref(), u.as_ref(), l.as_ref()) {
                if l.as_ref().map(|l| !k.root().identical(l.root())).unwrap_or(true) {
                    put(&mut out, path, &k);
                }
            }
            continue;
        }
        out.insert(path, bytes.to_vec());
    }
    for path in origin.paths().filter(|p| !updated.contains(p)) {
        out.remove(path);
    }
    Ok(MergeOutcome { files: out, warnings: Vec::new() })
}

fn resource_merge(origin: &FileSet, updated: &FileSet, local: &FileSet) -> Result<MergeOutcome> {
    let mut out = MergeOutcome { files: local.clone(), warnings: Vec::new() };
    merge_dir("", origin, updated, local, &mut out)?;
    Ok(out)
}

/// Merges the package at `dir`, then walks its direct subpackages.
fn merge_dir(dir: &str, origin: &FileSet, updated: &FileSet, local: &FileSet, out: &mut MergeOutcome) -> Result<()> {
    let merged = merge_package_files(
        &origin.package_files(dir),
        &updated.package_files(dir),
        &local.package_files(dir),
        &mut out.warnings,
    )
    .map_err(|e| if dir.is_empty() { e } else { e.with_path(dir) })?;
    let stale: Vec<String> = out.files.package_files(dir).paths().map(|p| join(dir, p)).collect();
    for p in stale {
        out.files.remove(&p);
    }
    out.files.graft(dir, &merged);

    let (od, ud, ld) = (origin.package_dirs(), updated.package_dirs(), local.package_dirs());
    let children: BTreeSet<String> = origin
        .child_packages(dir)
        .into_iter()
        .chain(updated.child_packages(dir))
        .chain(local.child_packages(dir))
        .collect();
    for child in children {
        let (in_o, in_u, in_l) = (od.contains(&child), ud.contains(&child), ld.contains(&child));
        let independent = in_l && has_own_upstream(local, &child)?;
        match (in_o, in_u, in_l) {
            _ if independent => {
                debug!(subpackage = %child, "leaving independently fetched subpackage alone");
            }
            (false, true, false) => out.files.graft(&child, &updated.subtree(&child)),
            (true, true, false) => debug!(subpackage = %child, "subpackage deleted locally"),
            (true, false, true) => {
                if local_edits(&origin.subtree(&child), &local.subtree(&child))?.is_empty() {
                    out.files.remove_subtree(&child);
                } else {
                    let msg = format!("subpackage {} was deleted upstream but has local changes; keeping it", child);
                    warn!(subpackage = %child, "{}", msg);
                    out.warnings.push(msg);
                }
            }
            (false, false, true) | (_, false, false) => {}
            (_, true, true) => merge_dir(&child, origin, updated, local, out)?,
        }
    }
    Ok(())
}

fn has_own_upstream(files: &FileSet, dir: &str) -> Result<bool> {
    Ok(parse_kptfile(files, &join(dir, KPTFILE_NAME))?
        .map(|k| k.root().get("upstream").map(|u| !u.is_null()).unwrap_or(false))
        .unwrap_or(false))
}

/// Subpackages whose Kptfile names an upstream of their own. These are
/// updated on their own, never as part of the enclosing package.
fn independent_subpackages(files: &FileSet) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for dir in files.subpackages() {
        if has_own_upstream(files, &dir)? {
            out.insert(dir);
        }
    }
    Ok(out)
}

fn is_under(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir).map(|rest| rest.starts_with('/')).unwrap_or(false)
}

fn join(dir: &str, rel: &str) -> String {
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", dir, rel)
    }
}

/// Merges the files of one package (no subpackages). KRM documents merge
/// per resource; other files merge as text.
fn merge_package_files(origin: &FileSet, updated: &FileSet, local: &FileSet, warnings: &mut Vec<String>) -> Result<FileSet> {
    let opts = ReadOptions::default();
    let (ok, uk, lk) = (krm_paths(origin, &opts)?, krm_paths(updated, &opts)?, krm_paths(local, &opts)?);

    let mut out = local.clone();
    let others: BTreeSet<&str> = origin
        .paths()
        .chain(updated.paths())
        .chain(local.paths())
        .filter(|p| *p != MANIFEST_FILE && !ok.contains(*p) && !uk.contains(*p) && !lk.contains(*p))
        .collect();
    for path in others {
        match merge_file(path, origin.get(path), updated.get(path), local.get(path), warnings) {
            Some(bytes) => out.insert(path, bytes),
            None => {
                out.remove(path);
            }
        }
    }

    let merged = merge_resources(
        &read_resources(origin, &opts)?,
        &read_resources(updated, &opts)?,
        &read_resources(local, &opts)?,
    );
    let had_manifest = local.contains(MANIFEST_FILE);
    write_resources(&mut out, &merged, &lk)?;
    if !had_manifest {
        out.remove(MANIFEST_FILE);
    }
    Ok(out)
}

fn merge_file(path: &str, o: Option<&[u8]>, u: Option<&[u8]>, l: Option<&[u8]>, warnings: &mut Vec<String>) -> Option<Vec<u8>> {
    if u == o {
        return l.map(<[u8]>::to_vec);
    }
    if l == o {
        return u.map(<[u8]>::to_vec);
    }
    let u = u?;
    let Some(l) = l else {
        // Deleted locally after upstream changed it.
        return if o.is_none() { Some(u.to_vec()) } else { None };
    };
    let texts = (
        std::str::from_utf8(o.unwrap_or_default()).ok(),
        std::str::from_utf8(u).ok(),
        std::str::from_utf8(l).ok(),
    );
    if let (Some(o), Some(u), Some(l)) = texts {
        if let Ok(merged) = merge_text(o, u, l) {
            return Some(merged.into_bytes());
        }
    }
    let msg = format!("{}: conflicting edits, taking upstream", path);
    warn!(file = %path, "conflicting edits, taking upstream");
    warnings.push(msg);
    Some(u.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpt_core::ErrorKind;

    const KPTFILE: &str = "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: app\n";

    fn deploy(replicas: u32) -> String {
        format!("apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: {}\n", replicas)
    }

    fn tree(entries: &[(&str, &str)]) -> FileSet {
        entries.iter().map(|(p, c)| (p.to_string(), c.as_bytes().to_vec())).collect()
    }

    #[test]
    fn upstream_wins_on_conflicting_scalars() {
        let o = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(3))]);
        let u = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(7))]);
        let l = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(11))]);
        let out = merge_packages(UpdateStrategy::ResourceMerge, &o, &u, &l).unwrap();
        assert_eq!(out.files.get_str("deploy.yaml"), Some(deploy(7).as_str()));
        assert!(!out.files.contains(MANIFEST_FILE));
    }

    #[test]
    fn unchanged_local_becomes_updated() {
        let o = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(3)), ("README.md", "old\n")]);
        let u = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(4)), ("README.md", "new\n"), ("svc.yaml", "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n")]);
        let out = merge_packages(UpdateStrategy::ResourceMerge, &o, &u, &o).unwrap();
        assert_eq!(out.files, u);
    }

    #[test]
    fn unchanged_upstream_keeps_local() {
        let o = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(3))]);
        let l = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &format!("# mine\n{}", deploy(5))), ("extra.txt", "x")]);
        let out = merge_packages(UpdateStrategy::ResourceMerge, &o, &o, &l).unwrap();
        assert_eq!(out.files, l);
    }

    #[test]
    fn fast_forward_refuses_local_edits() {
        let o = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(3)), ("cm.yaml", "a: 1\n")]);
        let u = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(4)), ("cm.yaml", "a: 1\n")]);
        let l = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(3)), ("cm.yaml", "a: 2\n")]);
        let err = merge_packages(UpdateStrategy::FastForward, &o, &u, &l).unwrap_err();
        assert!(err.is(ErrorKind::ConflictingEdits));
        assert_eq!(err.conflicts().len(), 1);
        assert_eq!(err.conflicts()[0].file, "cm.yaml");
        assert!(err.conflicts()[0].diff.contains("+a: 2"));
    }

    #[test]
    fn fast_forward_ignores_upstream_bookkeeping() {
        let o = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(3))]);
        let u = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(4))]);
        let fetched = format!("{}upstream:\n  type: git\n  git:\n    repo: r\n    directory: /\n    ref: main\n", KPTFILE);
        let l = tree(&[("Kptfile", &fetched), ("deploy.yaml", &deploy(3))]);
        let out = merge_packages(UpdateStrategy::FastForward, &o, &u, &l).unwrap();
        assert_eq!(out.files.get_str("deploy.yaml"), Some(deploy(4).as_str()));
    }

    #[test]
    fn fast_forward_skips_independent_subpackages() {
        let nested = "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: backend\nupstream:\n  type: git\n  git:\n    repo: r\n    directory: /db\n    ref: v2\n";
        let o = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(3)), ("backend/Kptfile", nested)]);
        let u = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(4)), ("backend/Kptfile", nested)]);
        let locked = format!("{}upstreamLock:\n  type: git\n  git:\n    repo: r\n    directory: /db\n    ref: v2\n    commit: abc\n", nested);
        let db = "apiVersion: v1\nkind: Service\nmetadata:\n  name: db\n";
        let l = tree(&[("Kptfile", KPTFILE), ("deploy.yaml", &deploy(3)), ("backend/Kptfile", &locked), ("backend/db.yaml", db)]);
        assert!(local_edits(&o, &l).unwrap().is_empty());

        let out = merge_packages(UpdateStrategy::FastForward, &o, &u, &l).unwrap();
        assert_eq!(out.files.get_str("deploy.yaml"), Some(deploy(4).as_str()));
        assert_eq!(out.files.get_str("backend/db.yaml"), Some(db));
        assert_eq!(out.files.get_str("backend/Kptfile"), Some(locked.as_str()));

        let mut edited = l.clone();
        edited.insert("deploy.yaml", deploy(9));
        let err = merge_packages(UpdateStrategy::FastForward, &o, &u, &edited).unwrap_err();
        assert!(err.is(ErrorKind::ConflictingEdits));
        let files: Vec<&str> = err.conflicts().iter().map(|c| c.file.as_str()).collect();
        assert_eq!(files, vec!["deploy.yaml"]);
    }

    #[test]
    fn force_replace_keeps_only_inventory() {
        let o = tree(&[("Kptfile", KPTFILE)]);
        let u = tree(&[("Kptfile", KPTFILE), ("new.yaml", &deploy(1))]);
        let inv = format!("{}inventory:\n  namespace: prod\n  name: inv\n", KPTFILE);
        let l = tree(&[("Kptfile", &inv), ("mine.yaml", "x: 1\n")]);
        let out = merge_packages(UpdateStrategy::ForceDeleteReplace, &o, &u, &l).unwrap();
        assert!(!out.files.contains("mine.yaml"));
        assert!(out.files.contains("new.yaml"));
        assert!(out.files.get_str("Kptfile").unwrap().contains("inventory:\n  namespace: prod\n"));
    }

    #[test]
    fn copy_merge_replaces_removes_and_keeps() {
        let o = tree(&[("Kptfile", KPTFILE), ("a.yaml", "a: 1\n"), ("gone.yaml", "g: 1\n")]);
        let u = tree(&[("Kptfile", KPTFILE), ("a.yaml", "a: 2\n"), ("b.yaml", "b: 1\n")]);
        let l = tree(&[("Kptfile", KPTFILE), ("a.yaml", "a: 9\n"), ("gone.yaml", "g: 1\n"), ("mine.yaml", "m: 1\n")]);
        let out = merge_packages(UpdateStrategy::CopyMerge, &o, &u, &l).unwrap();
        let paths: Vec<&str> = out.files.paths().collect();
        assert_eq!(paths, vec!["Kptfile", "a.yaml", "b.yaml", "mine.yaml"]);
        assert_eq!(out.files.get_str("a.yaml"), Some("a: 2\n"));
    }

    #[test]
    fn subpackage_rules() {
        let sub = |name: &str| format!("apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: {}\n", name);
        let o = tree(&[
            ("Kptfile", KPTFILE),
            ("gone/Kptfile", &sub("gone")),
            ("edited/Kptfile", &sub("edited")),
            ("edited/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  k: v\n"),
            ("both/Kptfile", &sub("both")),
            ("both/d.yaml", &deploy(1)),
        ]);
        let u = tree(&[
            ("Kptfile", KPTFILE),
            ("both/Kptfile", &sub("both")),
            ("both/d.yaml", &deploy(2)),
            ("fresh/Kptfile", &sub("fresh")),
        ]);
        let mut l = o.clone();
        l.insert("edited/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  k: mine\n");
        l.insert("mine/Kptfile", sub("mine"));
        let out = merge_packages(UpdateStrategy::ResourceMerge, &o, &u, &l).unwrap();
        let dirs: Vec<String> = out.files.subpackages();
        assert_eq!(dirs, vec!["both", "edited", "fresh", "mine"]);
        assert_eq!(out.files.get_str("both/d.yaml"), Some(deploy(2).as_str()));
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("edited"));
    }

    #[test]
    fn non_krm_files_merge_as_text() {
        let o = tree(&[("Kptfile", KPTFILE), ("notes.txt", "one\ntwo\nthree\n")]);
        let u = tree(&[("Kptfile", KPTFILE), ("notes.txt", "ONE\ntwo\nthree\n")]);
        let l = tree(&[("Kptfile", KPTFILE), ("notes.txt", "one\ntwo\nTHREE\n")]);
        let out = merge_packages(UpdateStrategy::ResourceMerge, &o, &u, &l).unwrap();
        assert_eq!(out.files.get_str("notes.txt"), Some("ONE\ntwo\nTHREE\n"));
    }
}
