//! Package orchestration engine (CaD: configuration as data).
//!
//! `CaDEngine` is the API surface of the orchestrator. It owns the
//! repository cache, turns package-revision requests into task pipelines,
//! and enforces the revision lifecycle:
//! Draft -> Proposed -> Published (by approval) -> DeletionProposed.

#![forbid(unsafe_code)]

pub mod lifecycle;
pub mod patch;
pub mod task;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kpt_cache::{Cache, CachedRepository, RepoKey};
use kpt_core::config::Settings;
use kpt_core::{CancellationToken, Error, Result, ResultExt};
use kpt_fetch::{Fetcher, Fetchers, LayoutRegistry};
use kpt_fnruntime::{FnRuntime, RenderStatus};
use kpt_pkg::FileSet;
use kpt_repository::{
    load_repositories, save_repositories, Backends, FunctionEntry, Lifecycle, PackageRevision, PackageRevisionKey, Repository,
    RepositoryConfig, Task,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use lifecycle::{check_approval, check_update};
pub use patch::{apply_patches, record_patches};
pub use task::{Materialized, Mutation, RevisionResolver, TaskExecutor};

/// Narrows `ListPackageRevisions`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
}

impl RevisionFilter {
    pub fn matches(&self, rev: &PackageRevision) -> bool {
        self.repository.as_deref().map_or(true, |r| rev.key.repository == r)
            && self.package.as_deref().map_or(true, |p| rev.key.package == p)
            && self.workspace.as_deref().map_or(true, |w| rev.key.workspace == w)
            && self.lifecycle.map_or(true, |l| rev.lifecycle == l)
    }
}

/// Resolves revisions through the cache.
struct CacheResolver {
    cache: Arc<Cache>,
    namespace: String,
}

#[async_trait]
impl RevisionResolver for CacheResolver {
    async fn resolve(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<(PackageRevision, FileSet)> {
        let repo = self
            .cache
            .get(&RepoKey::new(&self.namespace, &key.repository))
            .ok_or_else(|| Error::not_found(format!("repository {} is not registered", key.repository)))?;
        let rev = repo
            .list(cancel)
            .await?
            .into_iter()
            .find(|r| &r.key == key)
            .ok_or_else(|| Error::not_found(format!("package revision {} not found", key)))?;
        let files = repo.resources(key, cancel).await?;
        Ok((rev, files))
    }
}

pub struct CaDEngine {
    cache: Arc<Cache>,
    executor: TaskExecutor,
    namespace: String,
    repositories_file: Option<PathBuf>,
}

impl CaDEngine {
    pub fn new(cache: Arc<Cache>, fetcher: Arc<dyn Fetcher>, runtime: FnRuntime) -> Self {
        Self::in_namespace(cache, fetcher, runtime, "default")
    }

    pub fn in_namespace(cache: Arc<Cache>, fetcher: Arc<dyn Fetcher>, runtime: FnRuntime, namespace: &str) -> Self {
        let resolver = Arc::new(CacheResolver { cache: cache.clone(), namespace: namespace.to_string() });
        Self {
            cache,
            executor: TaskExecutor::new(fetcher, runtime, resolver),
            namespace: namespace.to_string(),
            repositories_file: None,
        }
    }

    /// Git and OCI stores, upstream fetchers and function runners as the
    /// environment configures them.
    pub fn from_settings(settings: &Settings) -> Self {
        let oci = Arc::new(LayoutRegistry::new(settings.cache_dir.join("oci")));
        let cache = Arc::new(Cache::from_settings(settings, Backends::from_settings(settings, oci)));
        Self::new(cache, Arc::new(Fetchers::from_settings(settings)), FnRuntime::from_settings(settings))
    }

    /// Persists registered repositories to `path` after every change.
    pub fn with_repositories_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.repositories_file = Some(path.into());
        self
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Registers every repository listed in the repositories file.
    pub async fn load_repositories(&self) -> Result<usize> {
        let Some(path) = &self.repositories_file else { return Ok(0) };
        let text = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::from(e).with_path(path)),
        };
        let repos = load_repositories(&text).map_err(|e| e.with_path(path))?;
        let n = repos.len();
        for config in repos {
            self.open(config).await?;
        }
        info!(file = %path.display(), repositories = n, "loaded repositories");
        Ok(n)
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.repositories_file else { return Ok(()) };
        let text = save_repositories(&self.list_repositories())?;
        tokio::fs::write(path, text).await.at_path(path)?;
        Ok(())
    }

    async fn open(&self, config: RepositoryConfig) -> Result<Arc<CachedRepository>> {
        if config.metadata.namespace != self.namespace {
            return Err(Error::invalid_param(format!(
                "repository {} is in namespace {}, the engine serves {}",
                config.name(),
                config.metadata.namespace,
                self.namespace
            )));
        }
        self.cache.open_repository(config).await
    }

    fn repo(&self, name: &str) -> Result<Arc<CachedRepository>> {
        self.cache
            .get(&RepoKey::new(&self.namespace, name))
            .ok_or_else(|| Error::not_found(format!("repository {} is not registered", name)))
    }

    fn record(op: &'static str, t0: Instant) {
        histogram!("kpt_engine_op_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        counter!("kpt_engine_ops_total", 1u64, "op" => op);
    }

    pub async fn register_repository(&self, config: RepositoryConfig) -> Result<()> {
        let name = config.name().to_string();
        self.open(config).await.op("engine.register")?;
        self.save().await?;
        info!(repo = %name, "registered repository");
        Ok(())
    }

    pub async fn unregister_repository(&self, name: &str) -> Result<()> {
        self.cache.close_repository(&RepoKey::new(&self.namespace, name)).await.op("engine.unregister")?;
        self.save().await?;
        info!(repo = %name, "unregistered repository");
        Ok(())
    }

    pub fn list_repositories(&self) -> Vec<RepositoryConfig> {
        self.cache.repositories().iter().map(|r| r.config().clone()).collect()
    }

    pub async fn list_package_revisions(&self, filter: &RevisionFilter, cancel: &CancellationToken) -> Result<Vec<PackageRevision>> {
        let mut out = Vec::new();
        for repo in self.cache.repositories() {
            if filter.repository.as_deref().is_some_and(|r| r != repo.key().name) {
                continue;
            }
            out.extend(repo.list(cancel).await?.into_iter().filter(|r| filter.matches(r)));
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    pub async fn get_package_revision(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<PackageRevision> {
        self.repo(&key.repository)?
            .list(cancel)
            .await?
            .into_iter()
            .find(|r| &r.key == key)
            .ok_or_else(|| Error::not_found(format!("package revision {} not found", key)).with_op("engine.get"))
    }

    pub async fn get_package_resources(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<FileSet> {
        self.get_package_revision(key, cancel).await?;
        self.repo(&key.repository)?.resources(key, cancel).await
    }

    /// Creates a Draft from `rev.tasks`. A revision without tasks is
    /// initialized empty.
    pub async fn create_package_revision(&self, rev: &PackageRevision, cancel: &CancellationToken) -> Result<PackageRevision> {
        let t0 = Instant::now();
        rev.key.validate().op("engine.create")?;
        if rev.lifecycle != Lifecycle::Draft {
            return Err(Error::lifecycle_forbidden(format!("new revisions start as Draft, not {}", rev.lifecycle)).with_op("engine.create"));
        }
        let repo = self.repo(&rev.key.repository)?;
        let tasks = if rev.tasks.is_empty() {
            vec![Task::Init { description: None, keywords: Vec::new(), site: None }]
        } else {
            rev.tasks.clone()
        };
        let out = self.executor.create(&rev.key, repo.config(), &tasks, cancel).await?;
        let created = repo.create(&PackageRevision::draft(rev.key.clone(), tasks).with_readiness_from(&out.files), &out.files, cancel).await?;
        Self::record("create", t0);
        info!(revision = %created.key, tasks = created.tasks.len(), took_ms = %t0.elapsed().as_millis(), "created package revision");
        Ok(created)
    }

    /// Applies a changed lifecycle and, for drafts, an appended Update task.
    /// Publishing goes through [`CaDEngine::approve_package_revision`].
    pub async fn update_package_revision(&self, rev: &PackageRevision, cancel: &CancellationToken) -> Result<PackageRevision> {
        let t0 = Instant::now();
        let repo = self.repo(&rev.key.repository)?;
        let mut current = self.get_package_revision(&rev.key, cancel).await?;

        if rev.tasks != current.tasks {
            let appended = match rev.tasks.split_last() {
                Some((last @ Task::Update { .. }, before)) if before == current.tasks.as_slice() => last.clone(),
                _ => {
                    return Err(Error::invalid_param("tasks are append-only; only an Update task can be added").with_op("engine.update"));
                }
            };
            if current.lifecycle != Lifecycle::Draft {
                return Err(Error::lifecycle_forbidden(format!("{} is {}; only drafts can be updated", rev.key, current.lifecycle)).with_op("engine.update"));
            }
            let files = repo.resources(&rev.key, cancel).await?;
            let out = self.executor.apply(&rev.key, repo.config(), &current.tasks, &appended, files, cancel).await?;
            let next = PackageRevision { tasks: rev.tasks.clone(), ..current.clone() };
            current = repo.update(&next, &out.files, cancel).await?;
            debug!(revision = %rev.key, "applied update task");
        }

        if rev.lifecycle != current.lifecycle {
            check_update(current.lifecycle, rev.lifecycle)?;
            current = repo.update_lifecycle(&rev.key, rev.lifecycle, cancel).await?;
        }
        Self::record("update", t0);
        info!(revision = %rev.key, lifecycle = %current.lifecycle, took_ms = %t0.elapsed().as_millis(), "updated package revision");
        Ok(current)
    }

    /// Publishes a Proposed revision whose readiness gates are all met.
    pub async fn approve_package_revision(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<PackageRevision> {
        let t0 = Instant::now();
        let current = self.get_package_revision(key, cancel).await?;
        check_approval(&current)?;
        let published = self.repo(&key.repository)?.update_lifecycle(key, Lifecycle::Published, cancel).await?;
        Self::record("approve", t0);
        info!(revision = %key, revision_name = ?published.revision_name(), "approved package revision");
        Ok(published)
    }

    /// Replaces a draft's files, recording the change as a Patch task, and
    /// renders the result.
    pub async fn update_package_resources(
        &self,
        key: &PackageRevisionKey,
        files: &FileSet,
        cancel: &CancellationToken,
    ) -> Result<(PackageRevision, RenderStatus)> {
        let t0 = Instant::now();
        let repo = self.repo(&key.repository)?;
        let current = self.get_package_revision(key, cancel).await?;
        if current.lifecycle != Lifecycle::Draft {
            return Err(Error::lifecycle_forbidden(format!("{} is {}; only drafts can be edited", key, current.lifecycle)).with_op("engine.resources"));
        }
        let old = repo.resources(key, cancel).await?;
        let patches = record_patches(&old, files)?;
        if patches.is_empty() {
            debug!(revision = %key, "resources unchanged");
            return Ok((current, RenderStatus::default()));
        }
        let task = Task::Patch { patches };
        let out = self.executor.apply(key, repo.config(), &current.tasks, &task, old, cancel).await?;
        let mut tasks = current.tasks.clone();
        tasks.push(task);
        let next = PackageRevision { tasks, ..current.clone() }.with_readiness_from(&out.files);
        if next.readiness_gates != current.readiness_gates || next.conditions != current.conditions {
            info!(revision = %key, gates = ?next.readiness_gates, "readiness changed");
        }
        let stored = repo.update(&next, &out.files, cancel).await?;
        Self::record("resources", t0);
        info!(revision = %key, tasks = stored.tasks.len(), took_ms = %t0.elapsed().as_millis(), "updated package resources");
        Ok((stored, out.render))
    }

    pub async fn delete_package_revision(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<()> {
        let t0 = Instant::now();
        self.get_package_revision(key, cancel).await?;
        self.repo(&key.repository)?.delete(key, cancel).await?;
        Self::record("delete", t0);
        info!(revision = %key, "deleted package revision");
        Ok(())
    }

    pub async fn list_functions(&self, cancel: &CancellationToken) -> Result<Vec<FunctionEntry>> {
        self.cache.list_functions(cancel).await
    }

    /// Stops every poller.
    pub async fn close(&self) {
        self.cache.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_match_on_every_set_field() {
        let mut rev = PackageRevision::draft(PackageRevisionKey::new("r", "app", "ws"), Vec::new());
        assert!(RevisionFilter::default().matches(&rev));
        let f = RevisionFilter { package: Some("app".into()), lifecycle: Some(Lifecycle::Draft), ..Default::default() };
        assert!(f.matches(&rev));
        rev.lifecycle = Lifecycle::Proposed;
        assert!(!f.matches(&rev));
        assert!(!RevisionFilter { repository: Some("other".into()), ..Default::default() }.matches(&rev));
    }
}
