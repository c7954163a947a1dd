//! Repository cache: one entry per registered repository.
//!
//! Each entry publishes an immutable snapshot of the repository's package
//! revisions and functions through an `ArcSwap`, so readers always see either
//! the previous or the next list, never a half-built one. A background
//! poller refreshes the snapshot on a fixed period; writes go through the
//! entry, which applies them to the snapshot optimistically and reloads from
//! the backend when the backend refuses them.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kpt_core::config::Settings;
use kpt_core::{CancellationToken, Error, Result};
use kpt_pkg::FileSet;
use kpt_repository::{
    open_repository, Backends, FunctionEntry, Lifecycle, PackageRevision, PackageRevisionKey, Repository, RepositoryConfig,
};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cache entries are keyed by repository namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoKey {
    pub namespace: String,
    pub name: String,
}

impl RepoKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self { namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn of(config: &RepositoryConfig) -> Self {
        Self::new(&config.metadata.namespace, &config.metadata.name)
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Point-in-time view of one repository.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Bumped on every swap.
    pub epoch: u64,
    /// False until the first successful load and after an invalidation.
    pub loaded: bool,
    pub revisions: Vec<PackageRevision>,
    pub functions: Vec<FunctionEntry>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub poll: Duration,
    pub poll_timeout: Duration,
}

impl CacheOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self { poll: settings.cache_poll, poll_timeout: settings.cache_poll_timeout }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { poll: Duration::from_secs(60), poll_timeout: Duration::from_secs(30) }
    }
}

pub struct CachedRepository {
    key: RepoKey,
    repo: Arc<dyn Repository>,
    snap: ArcSwap<Snapshot>,
    epoch_tx: watch::Sender<u64>,
    /// The single writer: refreshes and write-throughs hold it.
    writer: Mutex<()>,
    cancel: CancellationToken,
    poller: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CachedRepository {
    /// Wraps `repo` and starts its poller. The first poll runs immediately.
    pub fn open(repo: Arc<dyn Repository>, options: CacheOptions) -> Arc<Self> {
        let entry = Self::unpolled(repo);
        entry.spawn_poller(options);
        entry
    }

    /// Wraps `repo` without a poller; the snapshot loads on first read.
    pub fn unpolled(repo: Arc<dyn Repository>) -> Arc<Self> {
        let (epoch_tx, _) = watch::channel(0u64);
        Arc::new(Self {
            key: RepoKey::of(repo.config()),
            repo,
            snap: ArcSwap::from_pointee(Snapshot::default()),
            epoch_tx,
            writer: Mutex::new(()),
            cancel: CancellationToken::new(),
            poller: std::sync::Mutex::new(None),
        })
    }

    pub fn key(&self) -> &RepoKey {
        &self.key
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    fn spawn_poller(self: &Arc<Self>, options: CacheOptions) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let key = self.key.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(entry) = weak.upgrade() else { break };
                        let cycle = cancel.child_token();
                        match tokio::time::timeout(options.poll_timeout, entry.refresh(&cycle)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(repo = %key, error = %e, "cache refresh failed; retrying next cycle"),
                            Err(_) => {
                                cycle.cancel();
                                warn!(repo = %key, timeout_ms = %options.poll_timeout.as_millis(), "cache refresh timed out; retrying next cycle");
                            }
                        }
                    }
                }
            }
            debug!(repo = %key, "cache poller stopped");
        });
        if let Ok(mut slot) = self.poller.lock() {
            *slot = Some(handle);
        }
    }

    fn publish(&self, f: impl FnOnce(&mut Snapshot)) -> u64 {
        let mut next = (*self.snap.load_full()).clone();
        f(&mut next);
        next.epoch += 1;
        let epoch = next.epoch;
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(epoch);
        epoch
    }

    /// Reloads revisions and functions from the backend.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<u64> {
        let _w = self.writer.lock().await;
        self.reload(cancel).await
    }

    async fn reload(&self, cancel: &CancellationToken) -> Result<u64> {
        let t0 = Instant::now();
        let listed = async {
            let revisions = self.repo.list(cancel).await?;
            let functions = self.repo.list_functions(cancel).await?;
            Ok::<_, Error>((revisions, functions))
        }
        .await;
        let (revisions, functions) = match listed {
            Ok(v) => v,
            Err(e) => {
                counter!("kpt_cache_refresh_total", 1u64, "result" => "error");
                return Err(e.with_op("cache.refresh"));
            }
        };
        let count = revisions.len();
        let epoch = self.publish(|s| {
            s.loaded = true;
            s.revisions = revisions;
            s.functions = functions;
            s.refreshed_at = Some(Utc::now());
        });
        histogram!("kpt_cache_refresh_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kpt_cache_refresh_total", 1u64, "result" => "ok");
        debug!(repo = %self.key, revisions = count, epoch, took_ms = %t0.elapsed().as_millis(), "cache refreshed");
        Ok(epoch)
    }

    async fn loaded(&self, cancel: &CancellationToken) -> Result<Arc<Snapshot>> {
        let snap = self.current();
        if snap.loaded {
            return Ok(snap);
        }
        let _w = self.writer.lock().await;
        if !self.current().loaded {
            self.reload(cancel).await?;
        }
        Ok(self.current())
    }

    /// Applies `optimistic` to the snapshot, runs `call`, then settles the
    /// snapshot with the backend's answer. A refused write reloads the list.
    async fn write_through<T, F>(
        &self,
        op: &'static str,
        cancel: &CancellationToken,
        optimistic: impl FnOnce(&mut Vec<PackageRevision>),
        call: F,
        settle: impl FnOnce(&mut Vec<PackageRevision>, &T),
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _w = self.writer.lock().await;
        if !self.current().loaded {
            self.reload(cancel).await?;
        }
        self.publish(|s| optimistic(&mut s.revisions));
        match call.await {
            Ok(out) => {
                self.publish(|s| settle(&mut s.revisions, &out));
                counter!("kpt_cache_writes_total", 1u64, "op" => op, "result" => "ok");
                Ok(out)
            }
            Err(e) => {
                counter!("kpt_cache_writes_total", 1u64, "op" => op, "result" => "error");
                if let Err(re) = self.reload(cancel).await {
                    warn!(repo = %self.key, error = %re, "reload after failed write failed; invalidating");
                    self.publish(|s| s.loaded = false);
                }
                Err(e)
            }
        }
    }

    /// Stops the poller and closes the backend.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.poller.lock().ok().and_then(|mut h| h.take());
        if let Some(h) = handle {
            let _ = h.await;
        }
        self.repo.close().await?;
        info!(repo = %self.key, "closed cached repository");
        Ok(())
    }
}

fn upsert(revs: &mut Vec<PackageRevision>, rev: PackageRevision) {
    match revs.iter_mut().find(|r| r.key == rev.key) {
        Some(slot) => *slot = rev,
        None => revs.push(rev),
    }
}

#[async_trait]
impl Repository for CachedRepository {
    fn config(&self) -> &RepositoryConfig {
        self.repo.config()
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<PackageRevision>> {
        Ok(self.loaded(cancel).await?.revisions.clone())
    }

    async fn resources(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<FileSet> {
        self.repo.resources(key, cancel).await
    }

    async fn create(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision> {
        let pending = rev.clone().with_readiness_from(files);
        self.write_through(
            "create",
            cancel,
            |revs| revs.push(pending),
            self.repo.create(rev, files, cancel),
            |revs, out: &PackageRevision| upsert(revs, out.clone()),
        )
        .await
    }

    async fn update(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision> {
        let pending = rev.clone().with_readiness_from(files);
        self.write_through(
            "update",
            cancel,
            |revs| upsert(revs, pending),
            self.repo.update(rev, files, cancel),
            |revs, out: &PackageRevision| upsert(revs, out.clone()),
        )
        .await
    }

    async fn update_lifecycle(&self, key: &PackageRevisionKey, to: Lifecycle, cancel: &CancellationToken) -> Result<PackageRevision> {
        self.write_through(
            "lifecycle",
            cancel,
            |revs| {
                if let Some(r) = revs.iter_mut().find(|r| &r.key == key) {
                    r.lifecycle = to;
                }
            },
            self.repo.update_lifecycle(key, to, cancel),
            |revs, out: &PackageRevision| upsert(revs, out.clone()),
        )
        .await
    }

    async fn delete(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<()> {
        self.write_through("delete", cancel, |revs| revs.retain(|r| &r.key != key), self.repo.delete(key, cancel), |_, _| {})
            .await
    }

    async fn list_functions(&self, cancel: &CancellationToken) -> Result<Vec<FunctionEntry>> {
        Ok(self.loaded(cancel).await?.functions.clone())
    }

    async fn close(&self) -> Result<()> {
        CachedRepository::close(self).await
    }
}

/// Builds the store for a repository object.
pub type Opener = Arc<dyn Fn(RepositoryConfig) -> Result<Arc<dyn Repository>> + Send + Sync>;

/// All cached repositories of one orchestrator.
pub struct Cache {
    opener: Opener,
    options: CacheOptions,
    repos: RwLock<FxHashMap<RepoKey, Arc<CachedRepository>>>,
}

impl Cache {
    pub fn new(opener: Opener, options: CacheOptions) -> Self {
        Self { opener, options, repos: RwLock::new(FxHashMap::default()) }
    }

    pub fn from_settings(settings: &Settings, backends: Backends) -> Self {
        Self::new(Arc::new(move |config| open_repository(config, &backends)), CacheOptions::from_settings(settings))
    }

    /// Returns the entry for `config`, opening it on first use. A changed
    /// config replaces the old entry.
    pub async fn open_repository(&self, config: RepositoryConfig) -> Result<Arc<CachedRepository>> {
        let key = RepoKey::of(&config);
        let existing = self.get(&key);
        if let Some(entry) = existing {
            if entry.config() == &config {
                return Ok(entry);
            }
            debug!(repo = %key, "repository config changed; reopening");
            self.close_repository(&key).await?;
        }
        let repo = (self.opener)(config)?;
        let entry = CachedRepository::open(repo, self.options);
        self.repos
            .write()
            .map_err(|_| Error::internal("cache registry lock poisoned"))?
            .insert(key.clone(), entry.clone());
        counter!("kpt_cache_repositories_opened_total", 1u64);
        info!(repo = %key, "opened cached repository");
        Ok(entry)
    }

    pub async fn close_repository(&self, key: &RepoKey) -> Result<()> {
        let removed = self
            .repos
            .write()
            .map_err(|_| Error::internal("cache registry lock poisoned"))?
            .remove(key);
        match removed {
            Some(entry) => entry.close().await,
            None => Err(Error::not_found(format!("repository {} is not registered", key))),
        }
    }

    pub fn get(&self, key: &RepoKey) -> Option<Arc<CachedRepository>> {
        self.repos.read().ok().and_then(|m| m.get(key).cloned())
    }

    /// Entries sorted by key.
    pub fn repositories(&self) -> Vec<Arc<CachedRepository>> {
        let mut out: Vec<Arc<CachedRepository>> = self.repos.read().map(|m| m.values().cloned().collect()).unwrap_or_default();
        out.sort_by(|a, b| a.key().cmp(b.key()));
        out
    }

    /// Functions of every cached repository.
    pub async fn list_functions(&self, cancel: &CancellationToken) -> Result<Vec<FunctionEntry>> {
        let mut out = Vec::new();
        for entry in self.repositories() {
            out.extend(entry.list_functions(cancel).await?);
        }
        Ok(out)
    }

    pub async fn close(&self) {
        let entries: Vec<Arc<CachedRepository>> = match self.repos.write() {
            Ok(mut m) => m.drain().map(|(_, v)| v).collect(),
            Err(_) => Vec::new(),
        };
        for entry in entries {
            if let Err(e) = entry.close().await {
                warn!(repo = %entry.key(), error = %e, "closing repository failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpt_core::ErrorKind;
    use kpt_repository::MemoryRepository;

    fn key(ws: &str) -> PackageRevisionKey {
        PackageRevisionKey::new("mem", "app", ws)
    }

    #[tokio::test]
    async fn refused_writes_reload_the_snapshot() {
        let backend = Arc::new(MemoryRepository::new("mem"));
        let cache = CachedRepository::unpolled(backend.clone());
        let cancel = CancellationToken::new();
        let draft = PackageRevision::draft(key("a"), Vec::new());
        cache.create(&draft, &FileSet::new(), &cancel).await.unwrap();
        let err = cache.create(&draft, &FileSet::new(), &cancel).await.unwrap_err();
        assert!(err.is(ErrorKind::AlreadyExists));
        assert_eq!(cache.list(&cancel).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn writes_are_visible_without_a_refresh() {
        let backend = Arc::new(MemoryRepository::new("mem"));
        let cache = CachedRepository::unpolled(backend.clone());
        let cancel = CancellationToken::new();
        cache.create(&PackageRevision::draft(key("a"), Vec::new()), &FileSet::new(), &cancel).await.unwrap();
        let writes_before = backend.writes();
        let published = cache.update_lifecycle(&key("a"), Lifecycle::Published, &cancel).await.unwrap();
        assert_eq!(published.revision, Some(1));
        let listed = cache.list(&cancel).await.unwrap();
        assert_eq!(listed[0].lifecycle, Lifecycle::Published);
        assert_eq!(listed[0].revision, Some(1));
        assert_eq!(backend.writes(), writes_before + 1);
        cache.delete(&key("a"), &cancel).await.unwrap();
        assert!(cache.list(&cancel).await.unwrap().is_empty());
    }

    #[test]
    fn repo_keys_render_namespace_first() {
        assert_eq!(RepoKey::new("default", "blueprints").to_string(), "default/blueprints");
    }
}
