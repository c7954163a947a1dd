use std::path::{Path, PathBuf};
use std::time::Instant;

use kpt_core::{check_cancelled, CancellationToken, Error, ImageRef, Result};
use kpt_merge::merge_packages;
use kpt_pkg::{kptfile_of, kptfile_resource, put_kptfile, FileSet, UpdateStrategy, Upstream, UpstreamLock};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::Lifecycle;

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub package: PathBuf,
    /// New git ref or OCI tag; the current one when unset.
    pub git_ref: Option<String>,
    /// Overrides and records the update strategy.
    pub strategy: Option<UpdateStrategy>,
}

#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub strategy: UpdateStrategy,
    pub lock: UpstreamLock,
    pub warnings: Vec<String>,
    /// Files written or removed.
    pub changed: usize,
}

/// `current` pointed at another ref (git) or tag (OCI).
fn retarget(current: &Upstream, new_ref: Option<&str>) -> Result<Upstream> {
    let mut up = current.clone();
    let Some(r) = new_ref.filter(|r| !r.is_empty()) else {
        return Ok(up);
    };
    if let Some(g) = up.git.as_mut() {
        g.git_ref = r.to_string();
    }
    if let Some(o) = up.oci.as_mut() {
        let image = ImageRef::parse(&o.image)?;
        o.image = format!("{}:{}", image.name, r);
    }
    Ok(up)
}

fn changed_files(before: &FileSet, after: &FileSet) -> usize {
    let written = after.iter().filter(|(p, c)| before.get(p) != Some(*c)).count();
    let removed = before.paths().filter(|p| !after.contains(p)).count();
    written + removed
}

impl Lifecycle {
    /// Merges the upstream at a new ref into the local package.
    ///
    /// Nothing is written unless the merge succeeds, so a refused
    /// fast-forward leaves the directory as it was.
    pub async fn update(&self, opts: UpdateOptions, cancel: &CancellationToken) -> Result<UpdateReport> {
        let t0 = Instant::now();
        let dir = opts.package.as_path();
        let local = FileSet::from_dir(dir).map_err(|e| e.with_op("pkg.update"))?;
        let kptfile = kptfile_of(&local).map_err(|e| e.with_path(dir))?;
        let current = kptfile
            .upstream
            .clone()
            .ok_or_else(|| Error::missing_param("package has no upstream to update from").with_path(dir).with_op("pkg.update"))?;
        let strategy = opts.strategy.unwrap_or_else(|| current.strategy());
        let mut target = retarget(&current, opts.git_ref.as_deref())?;
        if opts.strategy.is_some() {
            target = target.with_strategy(opts.strategy);
        }
        self.fetcher.validate(&target)?;
        if strategy == UpdateStrategy::ResourceMerge {
            self.ensure_committed(dir, cancel).await?;
        }

        let origin = match &kptfile.upstream_lock {
            Some(lock) => self.fetcher.fetch_locked(lock, cancel).await?.files,
            None => {
                debug!(pkg = %dir.display(), "no upstream lock; merging without an origin");
                FileSet::new()
            }
        };
        let updated = self.fetcher.fetch(&target, cancel).await?;
        check_cancelled(cancel, "pkg.update")?;

        let outcome = merge_packages(strategy, &origin, &updated.files, &local).map_err(|e| e.with_path(dir))?;
        for w in &outcome.warnings {
            warn!(pkg = %dir.display(), "{}", w);
        }
        let mut files = outcome.files;
        let mut kf = kptfile_resource(&files)?;
        kpt_pkg::kptfile::set_upstream(&mut kf, &target, &updated.lock)?;
        put_kptfile(&mut files, &kf);

        let changed = changed_files(&local, &files);
        files.sync_to_dir(dir, &local).map_err(|e| e.with_op("pkg.update"))?;
        histogram!("kpt_pkg_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kpt_pkg_ops_total", 1u64, "op" => "update");
        info!(pkg = %dir.display(), strategy = %strategy, changed, warnings = outcome.warnings.len(), took_ms = %t0.elapsed().as_millis(), "updated package");
        Ok(UpdateReport { strategy, lock: updated.lock, warnings: outcome.warnings, changed })
    }

    /// Refuses to merge over uncommitted changes when the package lives in
    /// a git work tree.
    async fn ensure_committed(&self, dir: &Path, cancel: &CancellationToken) -> Result<()> {
        let Some(git) = &self.git else {
            return Ok(());
        };
        match git.run(dir, &["status", "--porcelain", "--", "."], cancel).await {
            Ok(out) if out.trim().is_empty() => Ok(()),
            Ok(_) => Err(Error::invalid_param("package has uncommitted changes; commit them before updating")
                .with_path(dir)
                .with_op("pkg.update")),
            Err(e) => {
                debug!(pkg = %dir.display(), error = %e, "not in a git work tree; skipping clean check");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retarget_git_and_oci() {
        let g = retarget(&Upstream::git("r", "/p", "v1"), Some("v2")).unwrap();
        assert_eq!(g.git.unwrap().git_ref, "v2");
        let o = retarget(&Upstream::oci("example.com/pkgs/app:v1"), Some("v2")).unwrap();
        assert_eq!(o.oci.unwrap().image, "example.com/pkgs/app:v2");
        let same = retarget(&Upstream::git("r", "/p", "v1"), None).unwrap();
        assert_eq!(same.git.unwrap().git_ref, "v1");
    }
}
