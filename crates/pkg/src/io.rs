//! Package reader and writer over a [`FileSet`].
//!
//! Reading yields resources in lexicographic path order, document order within
//! a file, each annotated with its package-relative path and in-file index.
//! Writing groups resources by those annotations and only touches files whose
//! serialized bytes changed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use kpt_core::{Error, Result, ResultExt, KPTFILE_NAME};
use kpt_yaml::{parse_file, serialize_stream, Format, Resource};
use tracing::debug;

use crate::fileset::FileSet;

/// Names of the files written by the previous write pass, as a JSON list.
pub const MANIFEST_FILE: &str = ".kpt-manifest";

pub const DEFAULT_GLOBS: &[&str] = &["*.yaml", "*.yml", "*.json", KPTFILE_NAME];

#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub globs: Vec<String>,
    /// Also read files of nested packages (their paths keep the subdirectory).
    pub include_subpackages: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { globs: DEFAULT_GLOBS.iter().map(|s| s.to_string()).collect(), include_subpackages: false }
    }
}

fn glob_set(globs: &[String]) -> Result<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for g in globs {
        b.add(Glob::new(g).map_err(|e| Error::invalid_param(format!("bad glob {:?}: {}", g, e)))?);
    }
    b.build().map_err(|e| Error::invalid_param(e.to_string()))
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parses every KRM file of the package rooted at the top of `files`.
pub fn read_resources(files: &FileSet, opts: &ReadOptions) -> Result<Vec<Resource>> {
    let globs = glob_set(&opts.globs)?;
    let mut out = Vec::new();
    for (path, bytes) in files.iter() {
        if path == MANIFEST_FILE || !globs.is_match(file_name(path)) {
            continue;
        }
        if !opts.include_subpackages && !files.owning_package(path).is_empty() {
            continue;
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::parse(format!("not utf-8: {}", e)))
            .at_path(path)
            .op("pkg.read")?;
        let docs = parse_file(path, text).at_path(path).op("pkg.read")?;
        for (index, mut doc) in docs.into_iter().enumerate() {
            doc.set_location(path, index);
            out.push(doc);
        }
    }
    debug!(resources = out.len(), "read package resources");
    Ok(out)
}

/// Default file for a resource with no path annotation: `<kind>_<name>.yaml`.
pub fn default_path(r: &Resource) -> String {
    let kind = r.kind().unwrap_or("resource").to_lowercase();
    let name = r.name().unwrap_or("unnamed");
    if r.is_kptfile() {
        return KPTFILE_NAME.to_string();
    }
    format!("{}_{}.yaml", kind, name)
}

pub fn read_manifest(files: &FileSet) -> BTreeSet<String> {
    files
        .get(MANIFEST_FILE)
        .and_then(|b| serde_json::from_slice::<Vec<String>>(b).ok())
        .map(|v| v.into_iter().collect())
        .unwrap_or_default()
}

/// Writes `resources` into `files`.
///
/// Files are removed when nothing targets them any more and either the
/// previous pass recorded them in the manifest or they are in `read_paths`
/// (the KRM files this pass read). Other files are never touched.
pub fn write_resources(files: &mut FileSet, resources: &[Resource], read_paths: &BTreeSet<String>) -> Result<()> {
    let mut by_file: BTreeMap<String, Vec<(usize, usize, Resource)>> = BTreeMap::new();
    for (seq, r) in resources.iter().enumerate() {
        let path = r.path_annotation().map(str::to_string).unwrap_or_else(|| default_path(r));
        if path.starts_with('/') || path.split('/').any(|c| c == "..") {
            return Err(Error::invalid_param(format!("resource {} targets {:?} outside the package", r.identity(), path))
                .with_op("pkg.write"));
        }
        let index = r.index_annotation().unwrap_or(usize::MAX);
        by_file.entry(path).or_default().push((index, seq, r.without_internal_annotations()));
    }

    let mut written = BTreeSet::new();
    for (path, mut docs) in by_file {
        docs.sort_by_key(|(index, seq, _)| (*index, *seq));
        let mut docs: Vec<Resource> = docs.into_iter().map(|(_, _, r)| r).collect();
        let want = Format::for_path(&path);
        if want == Format::Json && docs.len() > 1 {
            return Err(Error::invalid_param(format!("{} can hold only one JSON document", path)).with_op("pkg.write"));
        }
        for d in docs.iter_mut() {
            if d.format() != want {
                *d = d.clone().into_yaml();
                d.set_format(want);
            }
        }
        let text = serialize_stream(&docs);
        if files.get(&path) != Some(text.as_bytes()) {
            files.insert(path.clone(), text.into_bytes());
        }
        written.insert(path);
    }

    let previous = read_manifest(files);
    let stale: Vec<String> = previous
        .iter()
        .chain(read_paths.iter())
        .filter(|p| !written.contains(*p))
        .cloned()
        .collect();
    for p in &stale {
        files.remove(p);
    }
    if written.is_empty() {
        files.remove(MANIFEST_FILE);
    } else {
        let list: Vec<&String> = written.iter().collect();
        let manifest = serde_json::to_vec_pretty(&list)?;
        files.insert(MANIFEST_FILE, manifest);
    }
    debug!(files = written.len(), removed = stale.len(), "wrote package resources");
    Ok(())
}

/// Paths of the KRM files a read of `files` would parse.
pub fn krm_paths(files: &FileSet, opts: &ReadOptions) -> Result<BTreeSet<String>> {
    let globs = glob_set(&opts.globs)?;
    Ok(files
        .paths()
        .filter(|p| *p != MANIFEST_FILE && globs.is_match(file_name(p)))
        .filter(|p| opts.include_subpackages || files.owning_package(p).is_empty())
        .map(str::to_string)
        .collect())
}

/// Replaces the KRM content of `files` with `resources`, leaving non-KRM
/// files alone.
pub fn replace_resources(files: &mut FileSet, resources: &[Resource], opts: &ReadOptions) -> Result<()> {
    let read = krm_paths(files, opts)?;
    write_resources(files, resources, &read)
}

/// Reads the package at `dir` from disk.
pub fn read_package(dir: &Path) -> Result<Vec<Resource>> {
    let files = FileSet::from_dir(dir).at_path(dir)?;
    read_resources(&files, &ReadOptions::default()).at_path(dir)
}

/// Writes resources back to the package at `dir`, syncing only changed files.
pub fn write_package(dir: &Path, resources: &[Resource]) -> Result<()> {
    let before = FileSet::from_dir(dir).at_path(dir)?;
    let mut after = before.clone();
    replace_resources(&mut after, resources, &ReadOptions::default()).at_path(dir)?;
    after.sync_to_dir(dir, &before).at_path(dir)
}
