//! Package revisions stored as refs of one Git remote.
//!
//! - Draft: branch `drafts/<package>/<workspace>`
//! - Proposed: branch `proposals/<package>/<workspace>`
//! - Published: tag `<package>/v<n>`
//! - DeletionProposed: the published tag plus branch
//!   `deletionProposed/<package>/v<n>`
//!
//! Publishing also writes `refs/kpt/released/<package>/v<n>`, which deleting
//! the revision leaves in place. New revision numbers start above the highest
//! of these, so a deleted number is never handed out again.
//!
//! The package lives at `<directory>/<package>` in each ref's tree. Commit
//! messages carry the package, workspace and task list as trailers, so a
//! published tag still knows the workspace it came from.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kpt_core::{check_cancelled, CancellationToken, Error, Result, ResultExt, KPTFILE_NAME};
use kpt_fetch::GitCli;
use kpt_pkg::{read_resources, FileSet, ReadOptions};
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    check_draft, next_revision, not_found, package_path, parse_revision, ContentType, FunctionEntry, GitRepositorySpec,
    Lifecycle, PackageRevision, PackageRevisionKey, Repository, RepositoryConfig, Task,
};

const DRAFTS: &str = "drafts/";
const PROPOSALS: &str = "proposals/";
const DELETION_PROPOSED: &str = "deletionProposed/";
const REMOTE_PREFIX: &str = "refs/remotes/origin/";
const TAG_PREFIX: &str = "refs/tags/";
const RELEASED: &str = "refs/kpt/released/";

const PACKAGE_TRAILER: &str = "kpt-package: ";
const WORKSPACE_TRAILER: &str = "kpt-workspace: ";
const TASKS_TRAILER: &str = "kpt-tasks: ";

const FUNCTION_KIND: &str = "Function";
const FUNCTION_API_VERSION: &str = "config.porch.kpt.dev/v1alpha1";

/// Identity used for commits the store makes.
const COMMITTER: [&str; 4] = ["-c", "user.name=kpt", "-c", "user.email=kpt@kpt.dev"];

/// A revision together with the commit its ref points at.
#[derive(Debug, Clone)]
struct Located {
    rev: PackageRevision,
    commit: String,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CommitMeta {
    package: Option<String>,
    workspace: Option<String>,
    tasks: Vec<Task>,
}

fn commit_message(rev: &PackageRevision, summary: &str) -> Result<String> {
    let tasks = serde_json::to_string(&rev.tasks)?;
    Ok(format!(
        "{}\n\n{}{}\n{}{}\n{}{}\n",
        summary, PACKAGE_TRAILER, rev.key.package, WORKSPACE_TRAILER, rev.key.workspace, TASKS_TRAILER, tasks
    ))
}

fn parse_commit_message(body: &str) -> CommitMeta {
    let mut meta = CommitMeta::default();
    for line in body.lines() {
        if let Some(v) = line.strip_prefix(PACKAGE_TRAILER) {
            meta.package = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix(WORKSPACE_TRAILER) {
            meta.workspace = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix(TASKS_TRAILER) {
            match serde_json::from_str(v.trim()) {
                Ok(tasks) => meta.tasks = tasks,
                Err(e) => debug!(error = %e, "ignoring unreadable task trailer"),
            }
        }
    }
    meta
}

/// Output of `git log --format=%H%x00%B%x1e`.
fn parse_log(out: &str) -> BTreeMap<String, CommitMeta> {
    out.split('\x1e')
        .filter_map(|rec| {
            let (sha, body) = rec.trim_start_matches('\n').split_once('\0')?;
            Some((sha.to_string(), parse_commit_message(body)))
        })
        .collect()
}

/// Output of `git cat-file --batch`, one entry per request, `None` for
/// missing objects.
fn parse_cat_file(out: &str) -> Vec<Option<String>> {
    let bytes = out.as_bytes();
    let mut pos = 0;
    let mut entries = Vec::new();
    while pos < bytes.len() {
        let Some(eol) = bytes[pos..].iter().position(|b| *b == b'\n').map(|i| pos + i) else { break };
        let header = &out[pos..eol];
        pos = eol + 1;
        if header.ends_with(" missing") || header.ends_with(" ambiguous") {
            entries.push(None);
            continue;
        }
        let size = header.rsplit(' ').next().and_then(|s| s.parse::<usize>().ok()).unwrap_or(0);
        let end = (pos + size).min(bytes.len());
        entries.push(out.get(pos..end).map(str::to_string));
        pos = end + 1;
    }
    entries
}

/// Kind and `(package, workspace or v<n>)` of a ref, if it is one of ours.
enum RefKind {
    Draft(String, String),
    Proposed(String, String),
    Published(String, u32),
    DeletionProposed(String, u32),
}

fn classify_ref(name: &str) -> Option<RefKind> {
    if let Some(branch) = name.strip_prefix(REMOTE_PREFIX) {
        if let Some(rest) = branch.strip_prefix(DRAFTS) {
            let (pkg, ws) = rest.rsplit_once('/')?;
            return Some(RefKind::Draft(pkg.to_string(), ws.to_string()));
        }
        if let Some(rest) = branch.strip_prefix(PROPOSALS) {
            let (pkg, ws) = rest.rsplit_once('/')?;
            return Some(RefKind::Proposed(pkg.to_string(), ws.to_string()));
        }
        if let Some(rest) = branch.strip_prefix(DELETION_PROPOSED) {
            let (pkg, rev) = rest.rsplit_once('/')?;
            return Some(RefKind::DeletionProposed(pkg.to_string(), parse_revision(rev)?));
        }
        return None;
    }
    let tag = name.strip_prefix(TAG_PREFIX)?;
    let (pkg, rev) = tag.rsplit_once('/')?;
    Some(RefKind::Published(pkg.to_string(), parse_revision(rev)?))
}

fn branch_ref(prefix: &str, key: &PackageRevisionKey) -> String {
    format!("refs/heads/{}{}/{}", prefix, key.package, key.workspace)
}

fn tag_ref(package: &str, revision: u32) -> String {
    format!("refs/tags/{}/v{}", package, revision)
}

fn released_ref(package: &str, revision: u32) -> String {
    format!("{}{}/v{}", RELEASED, package, revision)
}

/// Highest revision of `package` among `refs/kpt/released` ref names.
fn highest_released(refnames: &str, package: &str) -> u32 {
    let prefix = format!("{}{}/", RELEASED, package);
    refnames
        .lines()
        .filter_map(|l| l.trim().strip_prefix(prefix.as_str()))
        .filter(|rev| !rev.contains('/'))
        .filter_map(parse_revision)
        .max()
        .unwrap_or(0)
}

fn deletion_ref(package: &str, revision: u32) -> String {
    format!("refs/heads/{}{}/v{}", DELETION_PROPOSED, package, revision)
}

/// Refs holding `rev` in the remote.
fn refs_of(rev: &PackageRevision) -> Vec<String> {
    match (rev.lifecycle, rev.revision) {
        (Lifecycle::Draft, _) => vec![branch_ref(DRAFTS, &rev.key)],
        (Lifecycle::Proposed, _) => vec![branch_ref(PROPOSALS, &rev.key)],
        (Lifecycle::Published, Some(n)) => vec![tag_ref(&rev.key.package, n)],
        (Lifecycle::DeletionProposed, Some(n)) => vec![tag_ref(&rev.key.package, n), deletion_ref(&rev.key.package, n)],
        _ => Vec::new(),
    }
}

pub struct GitRepository {
    config: RepositoryConfig,
    spec: GitRepositorySpec,
    git: Arc<GitCli>,
    work: tempfile::TempDir,
    /// Serializes use of the scratch clone; true once it is initialized.
    lock: Mutex<bool>,
}

impl GitRepository {
    pub fn new(config: RepositoryConfig, git: Arc<GitCli>) -> Result<Self> {
        let spec = config
            .spec
            .git
            .clone()
            .ok_or_else(|| Error::missing_param(format!("repository {} has no git spec", config.name())))?;
        let work = tempfile::Builder::new().prefix("kpt-repo-").tempdir()?;
        Ok(Self { config, spec, git, work, lock: Mutex::new(false) })
    }

    fn dir(&self) -> PathBuf {
        self.work.path().to_path_buf()
    }

    async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<String> {
        self.git.run(self.work.path(), args, cancel).await
    }

    /// Brings remote-tracking branches and tags up to date with the remote.
    async fn sync(&self, initialized: &mut bool, cancel: &CancellationToken) -> Result<()> {
        if !*initialized {
            self.run(&["init", "-q"], cancel).await?;
            *initialized = true;
        }
        self.git
            .run_remote_refs(
                self.work.path(),
                &["fetch", "-q", "--prune", "--force"],
                &self.spec.repo,
                &["+refs/heads/*:refs/remotes/origin/*", "+refs/tags/*:refs/tags/*", "+refs/kpt/*:refs/kpt/*"],
                cancel,
            )
            .await
            .op("repo.git.sync")?;
        Ok(())
    }

    async fn scan(&self, cancel: &CancellationToken) -> Result<Vec<Located>> {
        let out = self
            .run(&["for-each-ref", "--format=%(refname) %(objectname)", "refs/remotes/origin", "refs/tags"], cancel)
            .await?;
        let mut drafts = Vec::new();
        let mut published = Vec::new();
        let mut deletion = BTreeSet::new();
        for line in out.lines() {
            let Some((name, sha)) = line.split_once(' ') else { continue };
            match classify_ref(name) {
                Some(RefKind::Draft(p, w)) => drafts.push((p, w, Lifecycle::Draft, sha.to_string())),
                Some(RefKind::Proposed(p, w)) => drafts.push((p, w, Lifecycle::Proposed, sha.to_string())),
                Some(RefKind::Published(p, n)) => published.push((p, n, sha.to_string())),
                Some(RefKind::DeletionProposed(p, n)) => {
                    deletion.insert((p, n));
                }
                None => {}
            }
        }
        let shas: BTreeSet<&str> = drafts.iter().map(|d| d.3.as_str()).chain(published.iter().map(|p| p.2.as_str())).collect();
        if shas.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["log", "--no-walk=unsorted", "--format=%H%x00%B%x1e"];
        args.extend(shas.iter().copied());
        let metas = parse_log(&self.run(&args, cancel).await?);
        let meta = |sha: &str| metas.get(sha);

        let name = self.config.name().to_string();
        let mut found = Vec::new();
        for (pkg, ws, lifecycle, sha) in drafts {
            let tasks = meta(&sha).map(|m| m.tasks.clone()).unwrap_or_default();
            let mut rev = PackageRevision::draft(PackageRevisionKey::new(&name, &pkg, &ws), tasks);
            rev.lifecycle = lifecycle;
            found.push(Located { rev, commit: sha });
        }
        for (pkg, n, sha) in published {
            let m = meta(&sha);
            let ws = m.and_then(|m| m.workspace.clone()).unwrap_or_else(|| format!("v{}", n));
            let mut rev = PackageRevision::draft(PackageRevisionKey::new(&name, &pkg, &ws), m.map(|m| m.tasks.clone()).unwrap_or_default());
            rev.revision = Some(n);
            rev.lifecycle = if deletion.contains(&(pkg.clone(), n)) { Lifecycle::DeletionProposed } else { Lifecycle::Published };
            found.push(Located { rev, commit: sha });
        }
        self.fill_readiness(&mut found, cancel).await?;
        Ok(found)
    }

    /// Reads every revision's Kptfile in one `cat-file` call.
    async fn fill_readiness(&self, found: &mut [Located], cancel: &CancellationToken) -> Result<()> {
        let input: String = found
            .iter()
            .map(|l| format!("{}:{}/{}\n", l.commit, package_path(&self.spec.directory, &l.rev.key.package), KPTFILE_NAME))
            .collect();
        let out = self.git.run_input(self.work.path(), &["cat-file", "--batch"], input.as_bytes(), cancel).await?;
        for (l, text) in found.iter_mut().zip(parse_cat_file(&out)) {
            if let Some(text) = text {
                let mut files = FileSet::new();
                files.insert(KPTFILE_NAME, text);
                l.rev = l.rev.clone().with_readiness_from(&files);
            }
        }
        Ok(())
    }

    async fn locate(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<(Located, Vec<Located>)> {
        let all = self.scan(cancel).await?;
        let found = all.iter().find(|l| &l.rev.key == key).cloned().ok_or_else(|| not_found(key))?;
        Ok((found, all))
    }

    async fn checkout(&self, commit: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(&["-c", "advice.detachedHead=false", "checkout", "-q", "--force", "--detach", commit], cancel).await?;
        self.run(&["clean", "-fdq"], cancel).await?;
        Ok(())
    }

    /// Commit to build new drafts on: the branch head, or an empty root
    /// commit when the remote has no branch yet.
    async fn base_commit(&self, cancel: &CancellationToken) -> Result<String> {
        let branch = format!("{}{}", REMOTE_PREFIX, self.spec.branch);
        match self.run(&["rev-parse", "--verify", "-q", &branch], cancel).await {
            Ok(sha) => Ok(sha.trim().to_string()),
            Err(_) => {
                let empty = self.git.run_input(self.work.path(), &["hash-object", "-t", "tree", "-w", "--stdin"], b"", cancel).await?;
                let mut args: Vec<&str> = COMMITTER.to_vec();
                args.extend(["commit-tree", empty.trim(), "-m", "kpt: initialize repository"]);
                Ok(self.run(&args, cancel).await?.trim().to_string())
            }
        }
    }

    /// Commits `files` as the package content on top of `parent`.
    async fn commit_files(&self, parent: &str, rev: &PackageRevision, files: &FileSet, summary: &str, cancel: &CancellationToken) -> Result<String> {
        self.checkout(parent, cancel).await?;
        let pkg_dir = self.dir().join(package_path(&self.spec.directory, &rev.key.package));
        if pkg_dir.exists() {
            std::fs::remove_dir_all(&pkg_dir).at_path(&pkg_dir)?;
        }
        files.write_to_dir(&pkg_dir)?;
        self.run(&["add", "-A"], cancel).await?;
        let msg = commit_message(rev, summary)?;
        let mut args: Vec<&str> = COMMITTER.to_vec();
        args.extend(["commit", "-q", "--allow-empty", "-F", "-"]);
        self.git.run_input(self.work.path(), &args, msg.as_bytes(), cancel).await?;
        Ok(self.run(&["rev-parse", "HEAD"], cancel).await?.trim().to_string())
    }

    async fn push(&self, refspecs: &[String], cancel: &CancellationToken) -> Result<()> {
        let specs: Vec<&str> = refspecs.iter().map(String::as_str).collect();
        self.git
            .run_remote_refs(self.work.path(), &["push", "-q", "--atomic"], &self.spec.repo, &specs, cancel)
            .await
            .op("repo.git.push")?;
        debug!(repo = %self.config.name(), refs = ?refspecs, "pushed");
        Ok(())
    }

    fn record(&self, op: &'static str, t0: Instant) {
        histogram!("kpt_repo_op_ms", t0.elapsed().as_secs_f64() * 1000.0, "backend" => "git", "op" => op);
        counter!("kpt_repo_ops_total", 1u64, "backend" => "git", "op" => op);
    }
}

#[async_trait]
impl Repository for GitRepository {
    fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<PackageRevision>> {
        let t0 = Instant::now();
        let mut initialized = self.lock.lock().await;
        self.sync(&mut initialized, cancel).await?;
        let revs: Vec<PackageRevision> = self.scan(cancel).await?.into_iter().map(|l| l.rev).collect();
        self.record("list", t0);
        debug!(repo = %self.config.name(), revisions = revs.len(), took_ms = %t0.elapsed().as_millis(), "listed git repository");
        Ok(revs)
    }

    async fn resources(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<FileSet> {
        let mut initialized = self.lock.lock().await;
        self.sync(&mut initialized, cancel).await?;
        let (found, _) = self.locate(key, cancel).await?;
        self.checkout(&found.commit, cancel).await?;
        let dir = self.dir().join(package_path(&self.spec.directory, &key.package));
        if !dir.is_dir() {
            return Ok(FileSet::new());
        }
        FileSet::from_dir(&dir)
    }

    async fn create(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision> {
        let t0 = Instant::now();
        rev.key.validate()?;
        check_draft(rev)?;
        let mut initialized = self.lock.lock().await;
        self.sync(&mut initialized, cancel).await?;
        let all = self.scan(cancel).await?;
        if all.iter().any(|l| l.rev.key.package == rev.key.package && l.rev.key.workspace == rev.key.workspace) {
            return Err(Error::already_exists(format!("package revision {} already exists", rev.key)).with_op("repo.create"));
        }
        check_cancelled(cancel, "repo.create")?;
        let base = self.base_commit(cancel).await?;
        let commit = self.commit_files(&base, rev, files, &format!("kpt: create {}", rev.key.package), cancel).await?;
        self.push(&[format!("{}:{}", commit, branch_ref(DRAFTS, &rev.key))], cancel).await?;
        self.record("create", t0);
        info!(repo = %self.config.name(), package = %rev.key.package, workspace = %rev.key.workspace, took_ms = %t0.elapsed().as_millis(), "created draft");
        Ok(rev.clone().with_readiness_from(files))
    }

    async fn update(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision> {
        let t0 = Instant::now();
        let mut initialized = self.lock.lock().await;
        self.sync(&mut initialized, cancel).await?;
        let (found, _) = self.locate(&rev.key, cancel).await?;
        check_draft(&found.rev)?;
        let last = rev.tasks.last().map(Task::type_name).unwrap_or("update");
        let commit = self.commit_files(&found.commit, rev, files, &format!("kpt: {} {}", last, rev.key.package), cancel).await?;
        self.push(&[format!("{}:{}", commit, branch_ref(DRAFTS, &rev.key))], cancel).await?;
        self.record("update", t0);
        let stored = PackageRevision { lifecycle: Lifecycle::Draft, revision: None, ..rev.clone() };
        Ok(stored.with_readiness_from(files))
    }

    async fn update_lifecycle(&self, key: &PackageRevisionKey, to: Lifecycle, cancel: &CancellationToken) -> Result<PackageRevision> {
        let t0 = Instant::now();
        let mut initialized = self.lock.lock().await;
        self.sync(&mut initialized, cancel).await?;
        let (found, all) = self.locate(key, cancel).await?;
        let from = found.rev.lifecycle;
        if from == to {
            return Ok(found.rev);
        }
        let c = &found.commit;
        let mut next = found.rev.clone();
        let refspecs = match (from, to) {
            (Lifecycle::Draft, Lifecycle::Proposed) | (Lifecycle::Proposed, Lifecycle::Draft) => {
                next.lifecycle = to;
                vec![format!("{}:{}", c, refs_of(&next)[0]), format!(":{}", refs_of(&found.rev)[0])]
            }
            (Lifecycle::Draft | Lifecycle::Proposed, Lifecycle::Published) => {
                let revs: Vec<PackageRevision> = all.into_iter().map(|l| l.rev).collect();
                let released = self.run(&["for-each-ref", "--format=%(refname)", "refs/kpt/released"], cancel).await?;
                let n = next_revision(&revs, &key.package).max(highest_released(&released, &key.package) + 1);
                next.lifecycle = to;
                next.revision = Some(n);
                vec![
                    format!("{}:{}", c, tag_ref(&key.package, n)),
                    format!("{}:{}", c, released_ref(&key.package, n)),
                    format!(":{}", refs_of(&found.rev)[0]),
                ]
            }
            (Lifecycle::Published, Lifecycle::DeletionProposed) => {
                next.lifecycle = to;
                let n = found.rev.revision.unwrap_or_default();
                vec![format!("{}:{}", c, deletion_ref(&key.package, n))]
            }
            (Lifecycle::DeletionProposed, Lifecycle::Published) => {
                next.lifecycle = to;
                let n = found.rev.revision.unwrap_or_default();
                vec![format!(":{}", deletion_ref(&key.package, n))]
            }
            _ => {
                return Err(Error::lifecycle_forbidden(format!("{} cannot move from {} to {}", key, from, to)).with_op("repo.lifecycle"));
            }
        };
        self.push(&refspecs, cancel).await?;
        self.record("lifecycle", t0);
        info!(repo = %self.config.name(), package = %key.package, workspace = %key.workspace, from = %from, to = %to, revision = ?next.revision, "moved package revision");
        Ok(next)
    }

    async fn delete(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<()> {
        let t0 = Instant::now();
        let mut initialized = self.lock.lock().await;
        self.sync(&mut initialized, cancel).await?;
        let (found, _) = self.locate(key, cancel).await?;
        let refspecs: Vec<String> = refs_of(&found.rev).into_iter().map(|r| format!(":{}", r)).collect();
        self.push(&refspecs, cancel).await?;
        self.record("delete", t0);
        info!(repo = %self.config.name(), package = %key.package, workspace = %key.workspace, "deleted package revision");
        Ok(())
    }

    /// Function repositories hold `Function` objects on their branch.
    async fn list_functions(&self, cancel: &CancellationToken) -> Result<Vec<FunctionEntry>> {
        if self.config.spec.content != ContentType::Function {
            return Ok(Vec::new());
        }
        let mut initialized = self.lock.lock().await;
        self.sync(&mut initialized, cancel).await?;
        let branch = format!("{}{}", REMOTE_PREFIX, self.spec.branch);
        let Ok(head) = self.run(&["rev-parse", "--verify", "-q", &branch], cancel).await else {
            return Ok(Vec::new());
        };
        self.checkout(head.trim(), cancel).await?;
        let root = self.dir().join(self.spec.directory.trim_matches('/'));
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let files = FileSet::from_dir(&root)?;
        let resources = read_resources(&files, &ReadOptions { include_subpackages: true, ..Default::default() })?;
        Ok(resources
            .iter()
            .filter(|r| r.kind() == Some(FUNCTION_KIND) && r.api_version() == Some(FUNCTION_API_VERSION))
            .filter_map(|r| {
                let spec = r.root().get("spec")?;
                let keywords = spec
                    .get("keywords")
                    .and_then(|k| k.as_sequence())
                    .map(|s| s.iter().filter_map(|n| n.scalar_string()).collect())
                    .unwrap_or_default();
                Some(FunctionEntry {
                    name: r.name()?.to_string(),
                    image: spec.get_str("image")?.to_string(),
                    description: spec.get_str("description").unwrap_or_default().to_string(),
                    keywords,
                    repository: self.config.name().to_string(),
                })
            })
            .collect())
    }
}
