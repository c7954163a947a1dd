//! In-memory store for tests and for running the orchestrator without a
//! remote.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kpt_core::{check_cancelled, CancellationToken, Error, Result};
use kpt_pkg::FileSet;

use crate::{
    check_draft, next_revision, not_found, FunctionEntry, Lifecycle, PackageRevision, PackageRevisionKey, Repository,
    RepositoryConfig, RepositorySpec,
};

#[derive(Default)]
struct State {
    revisions: BTreeMap<PackageRevisionKey, (PackageRevision, FileSet)>,
    functions: Vec<FunctionEntry>,
    /// Bumped on every write; tests use it to observe refreshes.
    writes: u64,
}

pub struct MemoryRepository {
    config: RepositoryConfig,
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new(name: &str) -> Self {
        Self::with_config(RepositoryConfig::with_spec(name, RepositorySpec::default()))
    }

    pub fn with_config(config: RepositoryConfig) -> Self {
        Self { config, state: Mutex::new(State::default()) }
    }

    pub fn with_functions(self, functions: Vec<FunctionEntry>) -> Self {
        if let Ok(mut st) = self.state.lock() {
            st.functions = functions;
        }
        self
    }

    /// Stores a revision as-is, bypassing lifecycle checks.
    pub fn insert(&self, rev: PackageRevision, files: FileSet) {
        if let Ok(mut st) = self.state.lock() {
            st.writes += 1;
            st.revisions.insert(rev.key.clone(), (rev, files));
        }
    }

    pub fn writes(&self) -> u64 {
        self.state.lock().map(|s| s.writes).unwrap_or(0)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut st = self.state.lock().map_err(|_| Error::internal("memory repository lock poisoned"))?;
        f(&mut st)
    }
}

fn same_slot(a: &PackageRevisionKey, b: &PackageRevisionKey) -> bool {
    a.package == b.package && a.workspace == b.workspace
}

#[async_trait]
impl Repository for MemoryRepository {
    fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<PackageRevision>> {
        check_cancelled(cancel, "repo.list")?;
        self.with_state(|st| Ok(st.revisions.values().map(|(r, _)| r.clone()).collect()))
    }

    async fn resources(&self, key: &PackageRevisionKey, _cancel: &CancellationToken) -> Result<FileSet> {
        self.with_state(|st| st.revisions.get(key).map(|(_, f)| f.clone()).ok_or_else(|| not_found(key)))
    }

    async fn create(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision> {
        check_cancelled(cancel, "repo.create")?;
        rev.key.validate()?;
        check_draft(rev)?;
        self.with_state(|st| {
            if st.revisions.keys().any(|k| same_slot(k, &rev.key)) {
                return Err(Error::already_exists(format!("package revision {} already exists", rev.key)));
            }
            let stored = rev.clone().with_readiness_from(files);
            st.writes += 1;
            st.revisions.insert(rev.key.clone(), (stored.clone(), files.clone()));
            Ok(stored)
        })
    }

    async fn update(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision> {
        check_cancelled(cancel, "repo.update")?;
        self.with_state(|st| {
            let (current, _) = st.revisions.get(&rev.key).ok_or_else(|| not_found(&rev.key))?;
            check_draft(current)?;
            let stored = PackageRevision { lifecycle: Lifecycle::Draft, revision: None, ..rev.clone() }.with_readiness_from(files);
            st.writes += 1;
            st.revisions.insert(rev.key.clone(), (stored.clone(), files.clone()));
            Ok(stored)
        })
    }

    async fn update_lifecycle(&self, key: &PackageRevisionKey, to: Lifecycle, cancel: &CancellationToken) -> Result<PackageRevision> {
        check_cancelled(cancel, "repo.lifecycle")?;
        self.with_state(|st| {
            let all: Vec<PackageRevision> = st.revisions.values().map(|(r, _)| r.clone()).collect();
            let (rev, _) = st.revisions.get_mut(key).ok_or_else(|| not_found(key))?;
            if to.is_published() && rev.revision.is_none() {
                rev.revision = Some(next_revision(&all, &key.package));
            }
            rev.lifecycle = to;
            st.writes += 1;
            Ok(rev.clone())
        })
    }

    async fn delete(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel, "repo.delete")?;
        self.with_state(|st| {
            st.revisions.remove(key).ok_or_else(|| not_found(key))?;
            st.writes += 1;
            Ok(())
        })
    }

    async fn list_functions(&self, _cancel: &CancellationToken) -> Result<Vec<FunctionEntry>> {
        self.with_state(|st| Ok(st.functions.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpt_core::ErrorKind;

    fn key(ws: &str) -> PackageRevisionKey {
        PackageRevisionKey::new("mem", "app", ws)
    }

    #[tokio::test]
    async fn publishing_numbers_revisions() {
        let repo = MemoryRepository::new("mem");
        let cancel = CancellationToken::new();
        for ws in ["a", "b"] {
            repo.create(&PackageRevision::draft(key(ws), Vec::new()), &FileSet::new(), &cancel).await.unwrap();
            let published = repo.update_lifecycle(&key(ws), Lifecycle::Published, &cancel).await.unwrap();
            assert_eq!(published.revision_name().as_deref(), Some(if ws == "a" { "v1" } else { "v2" }));
        }
    }

    #[tokio::test]
    async fn workspace_slots_are_unique_and_published_content_is_frozen() {
        let repo = MemoryRepository::new("mem");
        let cancel = CancellationToken::new();
        let draft = PackageRevision::draft(key("a"), Vec::new());
        repo.create(&draft, &FileSet::new(), &cancel).await.unwrap();
        let err = repo.create(&draft, &FileSet::new(), &cancel).await.unwrap_err();
        assert!(err.is(ErrorKind::AlreadyExists));
        repo.update_lifecycle(&key("a"), Lifecycle::Published, &cancel).await.unwrap();
        let err = repo.update(&draft, &FileSet::new(), &cancel).await.unwrap_err();
        assert!(err.is(ErrorKind::LifecycleForbidden));
    }
}
