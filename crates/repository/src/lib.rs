//! Package-revision stores backed by Git or OCI.
//!
//! A store lists the revisions of every package in one registered
//! repository, creates and updates drafts, moves revisions through their
//! lifecycle and deletes them. The orchestrator never talks to a store
//! directly; it goes through the cache, which owns one store per repository.

#![forbid(unsafe_code)]

pub mod git;
pub mod memory;
pub mod oci;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use kpt_core::config::Settings;
use kpt_core::{CancellationToken, Error, Result, KPTFILE_NAME};
use kpt_fetch::{GitCli, OciClient};
use kpt_pkg::{Condition, FileSet, Function, Kptfile, Upstream};
use serde::{Deserialize, Serialize};

pub use git::GitRepository;
pub use memory::MemoryRepository;
pub use oci::OciRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    Draft,
    Proposed,
    Published,
    DeletionProposed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Draft => "Draft",
            Lifecycle::Proposed => "Proposed",
            Lifecycle::Published => "Published",
            Lifecycle::DeletionProposed => "DeletionProposed",
        }
    }

    /// Published and DeletionProposed revisions carry a revision number and
    /// their content is frozen.
    pub fn is_published(&self) -> bool {
        matches!(self, Lifecycle::Published | Lifecycle::DeletionProposed)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lifecycle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Draft" => Ok(Lifecycle::Draft),
            "Proposed" => Ok(Lifecycle::Proposed),
            "Published" => Ok(Lifecycle::Published),
            "DeletionProposed" => Ok(Lifecycle::DeletionProposed),
            other => Err(Error::invalid_param(format!("unknown lifecycle {:?}", other))),
        }
    }
}

/// Identifies one package revision. Unique within the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionKey {
    pub repository: String,
    pub package: String,
    pub workspace: String,
}

impl PackageRevisionKey {
    pub fn new(repository: &str, package: &str, workspace: &str) -> Self {
        Self { repository: repository.to_string(), package: package.to_string(), workspace: workspace.to_string() }
    }

    /// Package paths are relative and slash separated; workspaces are a
    /// single path segment.
    pub fn validate(&self) -> Result<()> {
        if self.repository.is_empty() {
            return Err(Error::missing_param("repository name is required"));
        }
        let pkg = &self.package;
        if pkg.is_empty() || pkg.starts_with('/') || pkg.ends_with('/') || pkg.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(Error::invalid_param(format!("invalid package name {:?}", pkg)));
        }
        let ws = &self.workspace;
        let valid = !ws.is_empty()
            && ws.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !ws.starts_with('.');
        if !valid {
            return Err(Error::invalid_param(format!("invalid workspace name {:?}", ws)));
        }
        Ok(())
    }
}

impl fmt::Display for PackageRevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.repository, self.package, self.workspace)
    }
}

impl FromStr for PackageRevisionKey {
    type Err = Error;

    /// `repository:package:workspace`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(r), Some(p), Some(w)) => {
                let key = Self::new(r, p, w);
                key.validate()?;
                Ok(key)
            }
            _ => Err(Error::invalid_param(format!("invalid revision {:?} (want repository:package:workspace)", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchType {
    CreateFile,
    DeleteFile,
    PatchFile,
}

/// One file's change. `contents` is the whole file for CreateFile and a
/// unified diff for PatchFile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    pub file: String,
    pub patch_type: PatchType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contents: String,
}

/// Where a Clone or Update task takes its content from: an external
/// upstream, or another revision known to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_ref: Option<PackageRevisionKey>,
}

/// A recorded mutation. Replaying a revision's tasks from an empty package
/// reproduces its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Task {
    Init {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        keywords: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        site: Option<String>,
    },
    Clone {
        upstream: UpstreamSource,
    },
    Edit {
        #[serde(rename = "sourceRef")]
        source_ref: PackageRevisionKey,
    },
    Eval {
        function: Function,
    },
    Patch {
        patches: Vec<PatchSpec>,
    },
    Update {
        upstream: UpstreamSource,
    },
}

impl Task {
    pub fn type_name(&self) -> &'static str {
        match self {
            Task::Init { .. } => "init",
            Task::Clone { .. } => "clone",
            Task::Edit { .. } => "edit",
            Task::Eval { .. } => "eval",
            Task::Patch { .. } => "patch",
            Task::Update { .. } => "update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevision {
    pub key: PackageRevisionKey,
    /// Assigned on publish: `n` of `v<n>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_gates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PackageRevision {
    pub fn draft(key: PackageRevisionKey, tasks: Vec<Task>) -> Self {
        Self { key, revision: None, lifecycle: Lifecycle::Draft, tasks, readiness_gates: Vec::new(), conditions: Vec::new() }
    }

    pub fn revision_name(&self) -> Option<String> {
        self.revision.map(|n| format!("v{}", n))
    }

    /// Copies readiness gates and conditions out of the package's Kptfile.
    pub fn with_readiness_from(mut self, files: &FileSet) -> Self {
        if let Some(k) = files.get_str(KPTFILE_NAME).and_then(|t| Kptfile::from_yaml(t).ok()) {
            self.readiness_gates = k.readiness_gates();
            self.conditions = k.conditions().to_vec();
        }
        self
    }
}

/// Parses `v<n>`.
pub fn parse_revision(s: &str) -> Option<u32> {
    s.strip_prefix('v').filter(|n| !n.starts_with('0')).and_then(|n| n.parse().ok())
}

/// The number the next published revision of `package` gets.
pub fn next_revision(revisions: &[PackageRevision], package: &str) -> u32 {
    revisions
        .iter()
        .filter(|r| r.key.package == package)
        .filter_map(|r| r.revision)
        .max()
        .unwrap_or(0)
        + 1
}

/// A function published by a function repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionEntry {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub repository: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    #[default]
    Git,
    Oci,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    Package,
    Function,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GitRepositorySpec {
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Subdirectory holding the packages.
    #[serde(default)]
    pub directory: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OciRepositorySpec {
    /// Image name prefix; packages are images below it.
    pub registry: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RepositorySpec {
    #[serde(rename = "type", default)]
    pub repo_type: RepositoryType,
    #[serde(default)]
    pub content: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitRepositorySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciRepositorySpec>,
    /// Functions added to the pipeline of packages initialized here.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutators: Vec<Function>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Function>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

/// A registered repository, shaped like a Kubernetes object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    #[serde(default = "repository_api_version")]
    pub api_version: String,
    #[serde(default = "repository_kind")]
    pub kind: String,
    pub metadata: RepositoryMeta,
    pub spec: RepositorySpec,
}

fn repository_api_version() -> String {
    "config.porch.kpt.dev/v1alpha1".to_string()
}

fn repository_kind() -> String {
    "Repository".to_string()
}

impl RepositoryConfig {
    pub fn git(name: &str, repo: &str, branch: &str, directory: &str) -> Self {
        let spec = RepositorySpec {
            repo_type: RepositoryType::Git,
            git: Some(GitRepositorySpec { repo: repo.to_string(), branch: branch.to_string(), directory: directory.to_string() }),
            ..Default::default()
        };
        Self::with_spec(name, spec)
    }

    pub fn oci(name: &str, registry: &str) -> Self {
        let spec = RepositorySpec {
            repo_type: RepositoryType::Oci,
            oci: Some(OciRepositorySpec { registry: registry.to_string() }),
            ..Default::default()
        };
        Self::with_spec(name, spec)
    }

    pub fn with_spec(name: &str, spec: RepositorySpec) -> Self {
        Self {
            api_version: repository_api_version(),
            kind: repository_kind(),
            metadata: RepositoryMeta { name: name.to_string(), namespace: default_namespace() },
            spec,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(Error::missing_param("repository metadata.name is required"));
        }
        match self.spec.repo_type {
            RepositoryType::Git => match &self.spec.git {
                Some(g) if !g.repo.is_empty() => Ok(()),
                _ => Err(Error::missing_param(format!("git repository {} needs spec.git.repo", self.name()))),
            },
            RepositoryType::Oci => match &self.spec.oci {
                Some(o) if !o.registry.is_empty() => Ok(()),
                _ => Err(Error::missing_param(format!("oci repository {} needs spec.oci.registry", self.name()))),
            },
        }
    }
}

/// Reads a list of repository objects from YAML.
pub fn load_repositories(text: &str) -> Result<Vec<RepositoryConfig>> {
    let repos: Vec<RepositoryConfig> = serde_yaml::from_str(text)?;
    let mut seen = BTreeMap::new();
    for r in &repos {
        r.validate()?;
        if seen.insert(r.name().to_string(), ()).is_some() {
            return Err(Error::already_exists(format!("repository {} is listed twice", r.name())));
        }
    }
    Ok(repos)
}

pub fn save_repositories(repos: &[RepositoryConfig]) -> Result<String> {
    Ok(serde_yaml::to_string(repos)?)
}

/// One package-revision store.
#[async_trait]
pub trait Repository: Send + Sync {
    fn config(&self) -> &RepositoryConfig;

    fn name(&self) -> &str {
        self.config().name()
    }

    /// Every revision of every package, in no particular order.
    async fn list(&self, cancel: &CancellationToken) -> Result<Vec<PackageRevision>>;

    /// Files of one revision, rooted at the package directory.
    async fn resources(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<FileSet>;

    /// Stores a new Draft. Fails when the package already has a revision in
    /// the same workspace.
    async fn create(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision>;

    /// Replaces the content and task list of a Draft.
    async fn update(&self, rev: &PackageRevision, files: &FileSet, cancel: &CancellationToken) -> Result<PackageRevision>;

    /// Moves a revision to `to`. Publishing assigns the next revision number.
    async fn update_lifecycle(&self, key: &PackageRevisionKey, to: Lifecycle, cancel: &CancellationToken) -> Result<PackageRevision>;

    async fn delete(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<()>;

    async fn list_functions(&self, _cancel: &CancellationToken) -> Result<Vec<FunctionEntry>> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Clients the stores share.
#[derive(Clone)]
pub struct Backends {
    pub git: Arc<GitCli>,
    pub oci: Arc<dyn OciClient>,
}

impl Backends {
    pub fn from_settings(settings: &Settings, oci: Arc<dyn OciClient>) -> Self {
        Self { git: Arc::new(GitCli::from_settings(settings)), oci }
    }
}

/// Opens the store a repository object describes.
pub fn open_repository(config: RepositoryConfig, backends: &Backends) -> Result<Arc<dyn Repository>> {
    config.validate()?;
    Ok(match config.spec.repo_type {
        RepositoryType::Git => Arc::new(GitRepository::new(config, backends.git.clone())?),
        RepositoryType::Oci => Arc::new(OciRepository::new(config, backends.oci.clone())),
    })
}

/// Path of `package` inside a repository subdirectory.
pub(crate) fn package_path(directory: &str, package: &str) -> String {
    let dir = directory.trim_matches('/');
    if dir.is_empty() {
        package.to_string()
    } else {
        format!("{}/{}", dir, package)
    }
}

pub(crate) fn not_found(key: &PackageRevisionKey) -> Error {
    Error::not_found(format!("package revision {} not found", key))
}

/// Errors for content writes to anything but a Draft.
pub(crate) fn check_draft(rev: &PackageRevision) -> Result<()> {
    if rev.lifecycle != Lifecycle::Draft {
        return Err(Error::lifecycle_forbidden(format!("{} is {}; only drafts can be changed", rev.key, rev.lifecycle)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_numbers_are_max_plus_one() {
        let mut revs = vec![
            PackageRevision::draft(PackageRevisionKey::new("r", "app", "a"), Vec::new()),
            PackageRevision::draft(PackageRevisionKey::new("r", "app", "b"), Vec::new()),
            PackageRevision::draft(PackageRevisionKey::new("r", "other", "c"), Vec::new()),
        ];
        assert_eq!(next_revision(&revs, "app"), 1);
        revs[0].revision = Some(3);
        revs[1].revision = Some(1);
        revs[2].revision = Some(9);
        assert_eq!(next_revision(&revs, "app"), 4);
        assert_eq!(parse_revision("v12"), Some(12));
        assert_eq!(parse_revision("v012"), None);
        assert_eq!(parse_revision("main"), None);
    }

    #[test]
    fn keys_are_validated() {
        assert!(PackageRevisionKey::new("r", "team/app", "ws-1").validate().is_ok());
        assert!(PackageRevisionKey::new("r", "../app", "ws").validate().is_err());
        assert!(PackageRevisionKey::new("r", "app", "a/b").validate().is_err());
        assert!(PackageRevisionKey::new("", "app", "ws").validate().is_err());

        let key: PackageRevisionKey = "blueprints:team/app:ws-1".parse().unwrap();
        assert_eq!(key, PackageRevisionKey::new("blueprints", "team/app", "ws-1"));
        assert_eq!(key.to_string().parse::<PackageRevisionKey>().unwrap(), key);
        assert!("blueprints:app".parse::<PackageRevisionKey>().is_err());
    }

    #[test]
    fn tasks_serialize_with_a_type_tag() {
        let task = Task::Eval { function: Function::image("ghcr.io/kptdev/krm-functions-catalog/set-labels:v0.2.0") };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "eval");
        assert_eq!(json["function"]["image"], "ghcr.io/kptdev/krm-functions-catalog/set-labels:v0.2.0");
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn repositories_file_round_trips() {
        let text = r#"
- metadata:
    name: blueprints
  spec:
    type: git
    git:
      repo: https://example.com/blueprints.git
      directory: pkgs
- metadata:
    name: deployments
    namespace: prod
  spec:
    type: oci
    oci:
      registry: registry.example.com/deployments
"#;
        let repos = load_repositories(text).unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].spec.git.as_ref().unwrap().branch, "main");
        assert_eq!(repos[0].metadata.namespace, "default");
        assert_eq!(repos[1].spec.repo_type, RepositoryType::Oci);
        let again = load_repositories(&save_repositories(&repos).unwrap()).unwrap();
        assert_eq!(again, repos);
    }

    #[test]
    fn duplicate_and_incomplete_repositories_are_rejected() {
        let dup = "- metadata: {name: a}\n  spec: {type: oci, oci: {registry: r}}\n- metadata: {name: a}\n  spec: {type: oci, oci: {registry: r}}\n";
        assert!(load_repositories(dup).is_err());
        let missing = "- metadata: {name: a}\n  spec: {type: git}\n";
        assert!(load_repositories(missing).is_err());
    }
}
