use std::path::{Path, PathBuf};
use std::time::Instant;

use kpt_core::{check_cancelled, CancellationToken, Error, ErrorKind, Result};
use kpt_pkg::{kptfile_of, kptfile_resource, put_kptfile, FileSet, Kptfile, UpdateStrategy, Upstream, UpstreamLock};
use metrics::counter;
use tracing::{debug, info};

use crate::{dir_name, Lifecycle};

/// Nested upstreams are followed this many levels deep.
const MAX_NESTING: usize = 8;

#[derive(Debug, Clone)]
pub struct GetOptions {
    pub upstream: Upstream,
    pub destination: PathBuf,
    /// Recorded in the Kptfile; resource-merge when unset.
    pub strategy: Option<UpdateStrategy>,
}

#[derive(Debug, Clone)]
pub struct GetReport {
    pub destination: PathBuf,
    pub lock: UpstreamLock,
    /// Subpackage directories fetched from their own upstreams.
    pub nested: Vec<String>,
    pub files: usize,
}

fn ensure_empty(dest: &Path) -> Result<()> {
    match std::fs::read_dir(dest) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(Error::already_exists(format!("destination {} exists and is not empty", dest.display()))
                    .with_path(dest)
                    .with_op("pkg.get"));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(_) if dest.is_file() => {
            Err(Error::already_exists(format!("destination {} is a file", dest.display())).with_path(dest).with_op("pkg.get"))
        }
        Err(e) => Err(Error::from(e).with_path(dest).with_op("pkg.get")),
    }
}

/// Points the package Kptfile at its upstream, creating one when the
/// upstream directory had none. The name follows the directory it lands in.
fn stamp_kptfile(files: &mut FileSet, name: &str, upstream: &Upstream, lock: &UpstreamLock) -> Result<()> {
    let mut kf = match kptfile_resource(files) {
        Ok(r) => r,
        Err(e) if e.is(ErrorKind::NotFound) => Kptfile::new(name).to_resource()?,
        Err(e) => return Err(e),
    };
    kf.set_name(name);
    kf.root_mut().remove("upstream");
    kf.root_mut().remove("upstreamLock");
    kpt_pkg::kptfile::set_upstream(&mut kf, upstream, lock)?;
    put_kptfile(files, &kf);
    Ok(())
}

/// Subpackages declaring an upstream they were never fetched from.
fn pending_nested(files: &FileSet) -> Vec<(String, Upstream)> {
    files
        .subpackages()
        .into_iter()
        .filter_map(|dir| {
            let kf = kptfile_of(&files.subtree(&dir)).ok()?;
            match (kf.upstream, kf.upstream_lock) {
                (Some(up), None) => Some((dir, up)),
                _ => None,
            }
        })
        .collect()
}

impl Lifecycle {
    /// Fetches `upstream` into an empty or missing destination.
    pub async fn get(&self, opts: GetOptions, cancel: &CancellationToken) -> Result<GetReport> {
        let t0 = Instant::now();
        let dest = opts.destination.as_path();
        ensure_empty(dest)?;
        let strategy = opts.strategy.unwrap_or_else(|| opts.upstream.strategy());
        let upstream = opts.upstream.clone().with_strategy(Some(strategy));
        self.fetcher.validate(&upstream)?;

        let fetched = self.fetcher.fetch(&upstream, cancel).await?;
        let mut files = fetched.files;
        stamp_kptfile(&mut files, &dir_name(dest), &upstream, &fetched.lock)?;
        let nested = self.fetch_nested(&mut files, cancel).await?;

        check_cancelled(cancel, "pkg.get")?;
        files.write_to_dir(dest).map_err(|e| e.with_op("pkg.get"))?;
        counter!("kpt_pkg_ops_total", 1u64, "op" => "get");
        info!(pkg = %dest.display(), files = files.len(), nested = nested.len(), took_ms = %t0.elapsed().as_millis(), "fetched package");
        Ok(GetReport { destination: dest.to_path_buf(), lock: fetched.lock, nested, files: files.len() })
    }

    async fn fetch_nested(&self, files: &mut FileSet, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut done = Vec::new();
        for _ in 0..MAX_NESTING {
            let pending = pending_nested(files);
            if pending.is_empty() {
                return Ok(done);
            }
            for (dir, upstream) in pending {
                check_cancelled(cancel, "pkg.get")?;
                let fetched = self.fetcher.fetch(&upstream, cancel).await.map_err(|e| e.with_path(&dir))?;
                let mut sub = fetched.files;
                let name = dir.rsplit('/').next().unwrap_or(&dir).to_string();
                stamp_kptfile(&mut sub, &name, &upstream, &fetched.lock)?;
                files.remove_subtree(&dir);
                files.graft(&dir, &sub);
                debug!(subpackage = %dir, "fetched nested upstream");
                done.push(dir);
            }
        }
        Err(Error::invalid_param(format!("nested upstreams go deeper than {} levels", MAX_NESTING)).with_op("pkg.get"))
    }
}
