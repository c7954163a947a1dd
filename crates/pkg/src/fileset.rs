//! In-memory package trees keyed by `/`-separated relative path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use kpt_core::{Error, Result, ResultExt, KPTFILE_NAME};
use tracing::debug;
use walkdir::WalkDir;

/// Directory names never treated as package content.
pub const IGNORED_DIRS: &[&str] = &[".git"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    files: BTreeMap<String, Vec<u8>>,
}

impl FromIterator<(String, Vec<u8>)> for FileSet {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        FileSet { files: iter.into_iter().collect() }
    }
}

fn join(prefix: &str, rel: &str) -> String {
    if prefix.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), rel)
    }
}

/// Parent directory of a relative path; `""` for top-level files.
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(d, _)| d).unwrap_or("")
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Files under `prefix/`, re-rooted at `prefix`.
    pub fn subtree(&self, prefix: &str) -> FileSet {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return self.clone();
        }
        let lead = format!("{}/", prefix);
        self.files
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&lead).map(|rel| (rel.to_string(), v.clone())))
            .collect()
    }

    /// Inserts every file of `other` under `prefix/`.
    pub fn graft(&mut self, prefix: &str, other: &FileSet) {
        let prefix = prefix.trim_matches('/');
        for (k, v) in &other.files {
            self.files.insert(join(prefix, k), v.clone());
        }
    }

    /// Removes every file under `prefix/` (or everything for `""`).
    pub fn remove_subtree(&mut self, prefix: &str) {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            self.files.clear();
            return;
        }
        let lead = format!("{}/", prefix);
        self.files.retain(|k, _| !k.starts_with(&lead));
    }

    /// Directories holding a Kptfile, including `""` for the root.
    pub fn package_dirs(&self) -> BTreeSet<String> {
        self.files
            .keys()
            .filter(|k| k.as_str() == KPTFILE_NAME || k.ends_with(&format!("/{}", KPTFILE_NAME)))
            .map(|k| parent_dir(k).to_string())
            .collect()
    }

    /// Nested package directories, excluding the root.
    pub fn subpackages(&self) -> Vec<String> {
        self.package_dirs().into_iter().filter(|d| !d.is_empty()).collect()
    }

    /// Directly nested packages of `dir`: subpackages with no other package in between.
    pub fn child_packages(&self, dir: &str) -> Vec<String> {
        let dirs = self.package_dirs();
        dirs.iter()
            .filter(|d| d.as_str() != dir && is_within(d, dir))
            .filter(|d| !dirs.iter().any(|mid| mid != *d && mid.as_str() != dir && is_within(mid, dir) && is_within(d, mid)))
            .cloned()
            .collect()
    }

    /// The innermost package directory containing `path`.
    pub fn owning_package(&self, path: &str) -> String {
        let dirs = self.package_dirs();
        let mut dir = parent_dir(path);
        loop {
            if dirs.contains(dir) {
                return dir.to_string();
            }
            if dir.is_empty() {
                return String::new();
            }
            dir = parent_dir(dir);
        }
    }

    /// Files of the package rooted at `dir`, excluding nested packages,
    /// re-rooted at `dir`.
    pub fn package_files(&self, dir: &str) -> FileSet {
        self.files
            .iter()
            .filter(|(k, _)| is_within(parent_dir(k), dir) && self.owning_package(k) == dir)
            .map(|(k, v)| (strip_dir(k, dir).to_string(), v.clone()))
            .collect()
    }

    pub fn from_dir(root: &Path) -> Result<FileSet> {
        let mut files = BTreeMap::new();
        if !root.exists() {
            return Err(Error::not_found(format!("{} does not exist", root.display())).with_op("fileset.read"));
        }
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !IGNORED_DIRS.iter().any(|d| e.file_name() == *d));
        for entry in walker {
            let entry = entry.map_err(|e| Error::internal(e.to_string()).with_op("fileset.read"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::internal(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            let bytes = std::fs::read(entry.path()).at_path(entry.path())?;
            files.insert(rel, bytes);
        }
        debug!(root = %root.display(), files = files.len(), "read file set");
        Ok(FileSet { files })
    }

    /// Writes every file under `root`, creating directories as needed.
    pub fn write_to_dir(&self, root: &Path) -> Result<()> {
        self.sync_to_dir(root, &FileSet::default())
    }

    /// Makes `root` match this set relative to `previous` (what is on disk):
    /// changed files are rewritten, files only in `previous` are deleted and
    /// directories left empty by that are removed.
    pub fn sync_to_dir(&self, root: &Path, previous: &FileSet) -> Result<()> {
        let mut written = 0usize;
        for (rel, bytes) in &self.files {
            if previous.get(rel) == Some(bytes.as_slice()) {
                continue;
            }
            let path = root.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).at_path(parent)?;
            }
            std::fs::write(&path, bytes).at_path(&path)?;
            written += 1;
        }
        let mut removed = 0usize;
        for rel in previous.files.keys().filter(|k| !self.files.contains_key(*k)) {
            let path = root.join(rel);
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::from(e).with_path(&path).with_op("fileset.sync")),
            }
            let mut dir = path.parent();
            while let Some(d) = dir {
                if d == root || std::fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
        debug!(root = %root.display(), written, removed, "synced file set");
        Ok(())
    }
}

fn is_within(path: &str, dir: &str) -> bool {
    dir.is_empty() || path == dir || path.starts_with(&format!("{}/", dir))
}

fn strip_dir<'a>(path: &'a str, dir: &str) -> &'a str {
    if dir.is_empty() {
        path
    } else {
        path.strip_prefix(dir).map(|p| p.trim_start_matches('/')).unwrap_or(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileSet {
        let mut fs = FileSet::new();
        fs.insert("Kptfile", "root");
        fs.insert("a.yaml", "a");
        fs.insert("sub/Kptfile", "sub");
        fs.insert("sub/b.yaml", "b");
        fs.insert("sub/deep/Kptfile", "deep");
        fs.insert("sub/deep/c.yaml", "c");
        fs.insert("plain/d.yaml", "d");
        fs
    }

    #[test]
    fn package_boundaries() {
        let fs = sample();
        assert_eq!(fs.subpackages(), vec!["sub".to_string(), "sub/deep".to_string()]);
        assert_eq!(fs.child_packages(""), vec!["sub".to_string()]);
        assert_eq!(fs.child_packages("sub"), vec!["sub/deep".to_string()]);
        assert_eq!(fs.owning_package("plain/d.yaml"), "");
        assert_eq!(fs.owning_package("sub/deep/c.yaml"), "sub/deep");
        let root = fs.package_files("");
        assert_eq!(root.paths().collect::<Vec<_>>(), vec!["Kptfile", "a.yaml", "plain/d.yaml"]);
        let sub: Vec<String> = fs.package_files("sub").paths().map(String::from).collect();
        assert_eq!(sub, vec!["Kptfile".to_string(), "b.yaml".to_string()]);
    }

    #[test]
    fn subtree_and_graft_are_inverse() {
        let fs = sample();
        let sub = fs.subtree("sub");
        assert_eq!(sub.len(), 4);
        let mut back = FileSet::new();
        back.graft("sub", &sub);
        assert_eq!(back.get_str("sub/deep/c.yaml"), Some("c"));
        let mut all = fs.clone();
        all.remove_subtree("sub");
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn disk_round_trip_and_sync() {
        let dir = tempfile::tempdir().unwrap();
        let fs = sample();
        fs.write_to_dir(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        let read = FileSet::from_dir(dir.path()).unwrap();
        assert_eq!(read, fs);

        let mut next = read.clone();
        next.remove_subtree("sub/deep");
        next.insert("a.yaml", "a2");
        next.sync_to_dir(dir.path(), &read).unwrap();
        assert!(!dir.path().join("sub/deep").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.yaml")).unwrap(), "a2");
        assert!(dir.path().join(".git/HEAD").exists());
    }
}
