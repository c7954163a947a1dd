//! Package revisions stored as images under one registry prefix.
//!
//! Each package is the image `<registry>/<package>`. Drafts and proposals
//! are tagged with their workspace name, published revisions with `v<n>`.
//! Every history entry of an image is a JSON record of the revision state;
//! entries that carry a task make up the task list and the newest entry
//! holds the current lifecycle.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kpt_core::{check_cancelled, CancellationToken, Error, ErrorKind, ImageRef, Result, KPTFILE_NAME};
use kpt_fetch::{Image, OciClient};
use kpt_pkg::Kptfile;
use kpt_pkg::FileSet;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    check_draft, next_revision, not_found, parse_revision, ContentType, FunctionEntry, Lifecycle, PackageRevision,
    PackageRevisionKey, Repository, RepositoryConfig, Task,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    package: String,
    workspace: String,
    lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task: Option<Task>,
}

impl HistoryEntry {
    fn state(rev: &PackageRevision) -> Self {
        Self {
            package: rev.key.package.clone(),
            workspace: rev.key.workspace.clone(),
            lifecycle: rev.lifecycle,
            revision: rev.revision,
            task: None,
        }
    }
}

fn history_of(rev: &PackageRevision) -> Result<Vec<String>> {
    let mut entries: Vec<HistoryEntry> =
        rev.tasks.iter().map(|t| HistoryEntry { task: Some(t.clone()), ..HistoryEntry::state(rev) }).collect();
    if entries.is_empty() {
        entries.push(HistoryEntry::state(rev));
    }
    entries.iter().map(|e| Ok(serde_json::to_string(e)?)).collect()
}

/// Rebuilds a revision from image history; `None` for foreign images.
fn revision_from(repository: &str, image: &Image) -> Option<PackageRevision> {
    let entries: Vec<HistoryEntry> = image.history.iter().filter_map(|h| serde_json::from_str(h).ok()).collect();
    let state = entries.last()?;
    let tasks = entries.iter().filter_map(|e| e.task.clone()).collect();
    let mut rev = PackageRevision::draft(PackageRevisionKey::new(repository, &state.package, &state.workspace), tasks);
    rev.lifecycle = state.lifecycle;
    rev.revision = state.revision;
    Some(rev.with_readiness_from(&image.files))
}

pub struct OciRepository {
    config: RepositoryConfig,
    registry: String,
    client: Arc<dyn OciClient>,
    /// Serializes writes; the registry itself is last-writer-wins.
    lock: Mutex<()>,
}

impl OciRepository {
    pub fn new(config: RepositoryConfig, client: Arc<dyn OciClient>) -> Self {
        let registry = config.spec.oci.as_ref().map(|o| o.registry.trim_end_matches('/').to_string()).unwrap_or_default();
        Self { config, registry, client, lock: Mutex::new(()) }
    }

    fn image_name(&self, package: &str) -> String {
        format!("{}/{}", self.registry, package)
    }

    /// Tag that holds `rev`.
    fn tag_of(rev: &PackageRevision) -> String {
        match rev.revision {
            Some(n) if rev.lifecycle.is_published() => format!("v{}", n),
            _ => rev.key.workspace.clone(),
        }
    }

    async fn scan(&self, cancel: &CancellationToken) -> Result<Vec<(PackageRevision, Image)>> {
        let prefix = format!("{}/", self.registry);
        let mut out = Vec::new();
        for name in self.client.repositories(&prefix).await? {
            check_cancelled(cancel, "repo.oci.list")?;
            let package = name.trim_start_matches(&prefix).to_string();
            for tag in self.client.tags(&name).await? {
                let image = match self.client.pull(&format!("{}:{}", name, tag)).await {
                    Ok(i) => i,
                    Err(e) if e.is(ErrorKind::NotFound) => continue,
                    Err(e) => return Err(e),
                };
                let Some(rev) = revision_from(self.config.name(), &image) else {
                    debug!(image = %name, tag = %tag, "skipping image without revision history");
                    continue;
                };
                if rev.key.package != package {
                    warn!(image = %name, tag = %tag, "image history names another package; skipping");
                    continue;
                }
                out.push((rev, image));
            }
        }
        Ok(out)
    }

    async fn locate(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<(PackageRevision, Image, Vec<PackageRevision>)> {
        let all = self.scan(cancel).await?;
        let revs: Vec<PackageRevision> = all.iter().map(|(r, _)| r.clone()).collect();
        let (rev, image) = all.into_iter().find(|(r, _)| &r.key == key).ok_or_else(|| not_found(key))?;
        Ok((rev, image, revs))
    }

    async fn push(&self, rev: &PackageRevision, files: &FileSet) -> Result<String> {
        let image = format!("{}:{}", self.image_name(&rev.key.package), Self::tag_of(rev));
        let digest = self.client.push(&image, files, &history_of(rev)?).await?;
        counter!("kpt_repo_ops_total", 1u64, "backend" => "oci", "op" => "push");
        debug!(%image, %digest, lifecycle = %rev.lifecycle, "pushed package revision");
        Ok(digest)
    }
}

#[async_trait]
impl Repository for OciRepository {
    fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<PackageRevision>> {
        let t0 = Instant::now();
        let revs: Vec<PackageRevision> = self.scan(cancel).await?.into_iter().map(|(r, _)| r).collect();
        counter!("kpt_repo_ops_total", 1u64, "backend" => "oci", "op" => "list");
        debug!(repo = %self.config.name(), revisions = revs.len(), took_ms = %t0.elapsed().as_millis(), "listed oci repository");
        Ok(revs)
    }

    async fn resources(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<FileSet> {
        let (_, image, _) = self.locate(key, cancel).await?;
        Ok(image.files)
    }

    async fn create(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision> {
        rev.key.validate()?;
        check_draft(rev)?;
        if parse_revision(&rev.key.workspace).is_some() {
            return Err(Error::invalid_param(format!("workspace {:?} clashes with published tags", rev.key.workspace)).with_op("repo.create"));
        }
        let _guard = self.lock.lock().await;
        let all = self.scan(cancel).await?;
        if all.iter().any(|(r, _)| r.key.package == rev.key.package && r.key.workspace == rev.key.workspace) {
            return Err(Error::already_exists(format!("package revision {} already exists", rev.key)).with_op("repo.create"));
        }
        self.push(rev, files).await?;
        info!(repo = %self.config.name(), package = %rev.key.package, workspace = %rev.key.workspace, "created draft");
        Ok(rev.clone().with_readiness_from(files))
    }

    async fn update(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision> {
        let _guard = self.lock.lock().await;
        let (current, _, _) = self.locate(&rev.key, cancel).await?;
        check_draft(&current)?;
        let stored = PackageRevision { lifecycle: Lifecycle::Draft, revision: None, ..rev.clone() };
        self.push(&stored, files).await?;
        Ok(stored.with_readiness_from(files))
    }

    async fn update_lifecycle(&self, key: &PackageRevisionKey, to: Lifecycle, cancel: &CancellationToken) -> Result<PackageRevision> {
        let _guard = self.lock.lock().await;
        let (current, image, all) = self.locate(key, cancel).await?;
        let from = current.lifecycle;
        if from == to {
            return Ok(current);
        }
        let mut next = current.clone();
        next.lifecycle = to;
        match (from, to) {
            (Lifecycle::Draft, Lifecycle::Proposed) | (Lifecycle::Proposed, Lifecycle::Draft) => {}
            (Lifecycle::Draft | Lifecycle::Proposed, Lifecycle::Published) => {
                let n = next_revision(&all, &key.package);
                let tag = format!("v{}", n);
                if self.client.tags(&self.image_name(&key.package)).await?.contains(&tag) {
                    return Err(Error::already_exists(format!("{}:{} is already published", self.image_name(&key.package), tag)).with_op("repo.publish"));
                }
                next.revision = Some(n);
            }
            (Lifecycle::Published, Lifecycle::DeletionProposed) | (Lifecycle::DeletionProposed, Lifecycle::Published) => {}
            _ => {
                return Err(Error::lifecycle_forbidden(format!("{} cannot move from {} to {}", key, from, to)).with_op("repo.lifecycle"));
            }
        }
        let mut history = image.history.clone();
        history.push(serde_json::to_string(&HistoryEntry::state(&next))?);
        let target = format!("{}:{}", self.image_name(&key.package), Self::tag_of(&next));
        self.client.push(&target, &image.files, &history).await?;
        if Self::tag_of(&next) != Self::tag_of(&current) {
            self.client.delete_tag(&format!("{}:{}", self.image_name(&key.package), Self::tag_of(&current))).await?;
        }
        counter!("kpt_repo_ops_total", 1u64, "backend" => "oci", "op" => "lifecycle");
        info!(repo = %self.config.name(), package = %key.package, workspace = %key.workspace, from = %from, to = %to, revision = ?next.revision, "moved package revision");
        Ok(next)
    }

    async fn delete(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lock.lock().await;
        let (current, _, _) = self.locate(key, cancel).await?;
        self.client
            .delete_tag(&format!("{}:{}", self.image_name(&key.package), Self::tag_of(&current)))
            .await?;
        counter!("kpt_repo_ops_total", 1u64, "backend" => "oci", "op" => "delete");
        info!(repo = %self.config.name(), package = %key.package, workspace = %key.workspace, "deleted package revision");
        Ok(())
    }

    /// Every tagged image under the prefix is a function.
    async fn list_functions(&self, cancel: &CancellationToken) -> Result<Vec<FunctionEntry>> {
        if self.config.spec.content != ContentType::Function {
            return Ok(Vec::new());
        }
        let prefix = format!("{}/", self.registry);
        let mut out = Vec::new();
        for name in self.client.repositories(&prefix).await? {
            check_cancelled(cancel, "repo.oci.functions")?;
            for tag in self.client.tags(&name).await? {
                let image = format!("{}:{}", name, tag);
                let info = match self.client.pull(&image).await {
                    Ok(img) => img
                        .files
                        .get_str(KPTFILE_NAME)
                        .and_then(|t| Kptfile::from_yaml(t).ok())
                        .and_then(|k| k.info),
                    Err(e) => {
                        warn!(%image, error = %e, "cannot read function image");
                        None
                    }
                };
                let short = ImageRef::parse(&image).map(|r| r.short_name().to_string()).unwrap_or_else(|_| name.clone());
                out.push(FunctionEntry {
                    name: format!("{}:{}", short, tag),
                    image,
                    description: info.as_ref().and_then(|i| i.description.clone()).unwrap_or_default(),
                    keywords: info.map(|i| i.keywords).unwrap_or_default(),
                    repository: self.config.name().to_string(),
                });
            }
        }
        Ok(out)
    }
}
