//! Upstream fetchers: resolve a git or OCI source to files plus the pin it
//! resolved to.

#![forbid(unsafe_code)]

pub mod auth;
pub mod git;
pub mod github;
pub mod oci;
pub mod retry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kpt_core::config::Settings;
use kpt_core::{CancellationToken, Error, Result};
use kpt_pkg::{FileSet, GitLock, OciLock, OriginType, Upstream, UpstreamLock};
use kpt_yaml::Resource;

pub use auth::{Credential, CredentialResolver, EnvCredentials, StaticCredentials};
pub use git::{GitCli, GitFetcher, RemoteRefs};
pub use github::{parse_git_arg, resolve_git_arg, GitArg};
pub use oci::{Image, LayoutRegistry, OciClient, OciFetcher};

/// Files of an upstream and the lock that pins them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub files: FileSet,
    pub lock: UpstreamLock,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Checks an upstream without contacting it.
    fn validate(&self, upstream: &Upstream) -> Result<()>;

    async fn fetch(&self, upstream: &Upstream, cancel: &CancellationToken) -> Result<Fetched>;

    /// Fetches exactly the pinned content.
    async fn fetch_locked(&self, lock: &UpstreamLock, cancel: &CancellationToken) -> Result<Fetched>;

    /// Records the upstream and its lock in a Kptfile.
    fn apply_upstream(&self, kptfile: &mut Resource, upstream: &Upstream, lock: &UpstreamLock) -> Result<()> {
        kpt_pkg::kptfile::set_upstream(kptfile, upstream, lock)
    }
}

/// Dispatches to the fetcher registered for an upstream's origin type.
#[derive(Default, Clone)]
pub struct Fetchers {
    by_origin: HashMap<OriginType, Arc<dyn Fetcher>>,
}

impl Fetchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Git through the configured binary and OCI through a layout registry
    /// under the cache directory.
    pub fn from_settings(settings: &Settings) -> Self {
        let git = Arc::new(GitCli::from_settings(settings));
        let oci = Arc::new(LayoutRegistry::new(settings.cache_dir.join("oci")));
        Self::new()
            .with(OriginType::Git, Arc::new(GitFetcher::new(git)))
            .with(OriginType::Oci, Arc::new(OciFetcher::new(oci).with_backoff(settings.retry_backoff)))
    }

    pub fn with(mut self, origin: OriginType, fetcher: Arc<dyn Fetcher>) -> Self {
        self.by_origin.insert(origin, fetcher);
        self
    }

    pub fn get(&self, origin: OriginType) -> Result<&Arc<dyn Fetcher>> {
        self.by_origin
            .get(&origin)
            .ok_or_else(|| Error::invalid_param(format!("no fetcher for upstream type {:?}", origin)).with_op("fetch"))
    }
}

#[async_trait]
impl Fetcher for Fetchers {
    fn validate(&self, upstream: &Upstream) -> Result<()> {
        self.get(upstream.origin)?.validate(upstream)
    }

    async fn fetch(&self, upstream: &Upstream, cancel: &CancellationToken) -> Result<Fetched> {
        kpt_core::check_cancelled(cancel, "fetch")?;
        self.get(upstream.origin)?.fetch(upstream, cancel).await
    }

    async fn fetch_locked(&self, lock: &UpstreamLock, cancel: &CancellationToken) -> Result<Fetched> {
        kpt_core::check_cancelled(cancel, "fetch")?;
        self.get(lock.origin)?.fetch_locked(lock, cancel).await
    }
}

/// In-memory fetcher for tests. Git sources are keyed by
/// `repo`, `directory` and ref; every published version gets a fake commit.
#[derive(Default)]
pub struct MemoryFetcher {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    // (repo, directory, ref) -> commit
    refs: HashMap<(String, String, String), String>,
    // (repo, directory, commit) -> files
    trees: HashMap<(String, String, String), FileSet>,
    images: HashMap<String, (String, FileSet)>,
    digests: HashMap<String, FileSet>,
    next: u64,
}

fn dir_key(d: &str) -> String {
    d.trim_matches('/').to_string()
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `files` as `repo/directory@git_ref` and returns its commit.
    pub fn publish_git(&self, repo: &str, directory: &str, git_ref: &str, files: FileSet) -> String {
        let mut s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        s.next += 1;
        let commit = format!("{:040x}", s.next);
        s.refs.insert((repo.to_string(), dir_key(directory), git_ref.to_string()), commit.clone());
        s.trees.insert((repo.to_string(), dir_key(directory), commit.clone()), files);
        commit
    }

    pub fn publish_oci(&self, image: &str, files: FileSet) -> String {
        let mut s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        s.next += 1;
        let digest = format!("sha256:{:064x}", s.next);
        s.images.insert(image.to_string(), (digest.clone(), files.clone()));
        s.digests.insert(digest.clone(), files);
        digest
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    fn validate(&self, upstream: &Upstream) -> Result<()> {
        match upstream.origin {
            OriginType::Git if upstream.git.is_none() => Err(Error::missing_param("upstream.git is required")),
            OriginType::Oci if upstream.oci.is_none() => Err(Error::missing_param("upstream.oci is required")),
            _ => Ok(()),
        }
    }

    async fn fetch(&self, upstream: &Upstream, cancel: &CancellationToken) -> Result<Fetched> {
        kpt_core::check_cancelled(cancel, "fetch")?;
        self.validate(upstream)?;
        let s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(g) = &upstream.git {
            let commit = s
                .refs
                .get(&(g.repo.clone(), dir_key(&g.directory), g.git_ref.clone()))
                .cloned()
                .unwrap_or_else(|| g.git_ref.clone());
            let files = s
                .trees
                .get(&(g.repo.clone(), dir_key(&g.directory), commit.clone()))
                .cloned()
                .ok_or_else(|| Error::not_found(format!("{}/{}@{} not found", g.repo, g.directory, g.git_ref)).with_op("fetch"))?;
            let lock = UpstreamLock::git(GitLock {
                repo: g.repo.clone(),
                directory: g.directory.clone(),
                git_ref: g.git_ref.clone(),
                commit,
            });
            return Ok(Fetched { files, lock });
        }
        let image = upstream.oci.as_ref().map(|o| o.image.clone()).unwrap_or_default();
        let (digest, files) = s
            .images
            .get(&image)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("image {} not found", image)).with_op("fetch"))?;
        Ok(Fetched { files, lock: UpstreamLock::oci(OciLock { image, digest }) })
    }

    async fn fetch_locked(&self, lock: &UpstreamLock, cancel: &CancellationToken) -> Result<Fetched> {
        kpt_core::check_cancelled(cancel, "fetch")?;
        let s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let files = match (&lock.git, &lock.oci) {
            (Some(g), _) => s.trees.get(&(g.repo.clone(), dir_key(&g.directory), g.commit.clone())).cloned(),
            (None, Some(o)) => s.digests.get(&o.digest).cloned(),
            (None, None) => None,
        };
        let files = files.ok_or_else(|| Error::not_found("locked upstream not found").with_op("fetch"))?;
        Ok(Fetched { files, lock: lock.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(v: &str) -> FileSet {
        let mut f = FileSet::new();
        f.insert("cm.yaml", format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\ndata:\n  v: \"{}\"\n", v));
        f
    }

    #[tokio::test]
    async fn memory_fetcher_pins_commits() {
        let m = MemoryFetcher::new();
        let c1 = m.publish_git("repo", "/pkg", "main", files("1"));
        let token = CancellationToken::new();
        let first = m.fetch(&Upstream::git("repo", "/pkg", "main"), &token).await.unwrap();
        assert_eq!(first.lock.git.as_ref().unwrap().commit, c1);

        m.publish_git("repo", "/pkg", "main", files("2"));
        let latest = m.fetch(&Upstream::git("repo", "/pkg", "main"), &token).await.unwrap();
        assert_eq!(latest.files, files("2"));
        let pinned = m.fetch_locked(&first.lock, &token).await.unwrap();
        assert_eq!(pinned.files, files("1"));
    }

    #[tokio::test]
    async fn dispatch_by_origin() {
        let m = Arc::new(MemoryFetcher::new());
        m.publish_oci("example.com/app:v1", files("1"));
        let f = Fetchers::new().with(OriginType::Oci, m.clone());
        let token = CancellationToken::new();
        assert!(f.fetch(&Upstream::oci("example.com/app:v1"), &token).await.is_ok());
        let err = f.fetch(&Upstream::git("r", "/", "main"), &token).await.unwrap_err();
        assert!(err.is(kpt_core::ErrorKind::InvalidParam));
    }

    #[tokio::test]
    async fn cancelled_fetch_stops_early() {
        let m = MemoryFetcher::new();
        let token = CancellationToken::new();
        token.cancel();
        assert!(m.fetch(&Upstream::git("r", "/", "main"), &token).await.is_err());
    }
}
