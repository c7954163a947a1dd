//! Task pipeline executor.
//!
//! Every recorded task maps to a mutation over the package's files. The
//! executor threads one file set through the mutations in order and always
//! finishes with a render of the Kptfile pipeline.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use kpt_core::{check_cancelled, CancellationToken, Error, Result};
use kpt_fetch::Fetcher;
use kpt_fnruntime::{FnRuntime, RenderStatus};
use kpt_merge::merge_packages;
use kpt_pkg::{kptfile_of, kptfile_resource, put_kptfile, FileSet, Function, Kptfile, PackageInfo, Pipeline, UpdateStrategy};
use kpt_repository::{PackageRevision, PackageRevisionKey, RepositoryConfig, Task, UpstreamSource};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::patch::apply_patches;

/// Looks up revisions other tasks refer to.
#[async_trait]
pub trait RevisionResolver: Send + Sync {
    async fn resolve(&self, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<(PackageRevision, FileSet)>;
}

/// One step of the pipeline.
#[async_trait]
pub trait Mutation: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, files: FileSet, cancel: &CancellationToken) -> Result<FileSet>;
}

/// Files produced by a pipeline run and the render that closed it.
#[derive(Debug, Clone, Default)]
pub struct Materialized {
    pub files: FileSet,
    pub render: RenderStatus,
}

/// Package name recorded in Kptfiles: the last path segment.
pub fn package_name(package: &str) -> &str {
    package.rsplit('/').next().unwrap_or(package)
}

fn rename(files: &mut FileSet, name: &str) -> Result<()> {
    let mut kf = kptfile_resource(files)?;
    kf.set_name(name);
    put_kptfile(files, &kf);
    Ok(())
}

async fn resolve_published(
    resolver: &dyn RevisionResolver,
    key: &PackageRevisionKey,
    cancel: &CancellationToken,
) -> Result<FileSet> {
    let (rev, files) = resolver.resolve(key, cancel).await?;
    if !rev.lifecycle.is_published() {
        return Err(Error::invalid_param(format!("{} is {}; only published revisions can be used as a source", key, rev.lifecycle)));
    }
    Ok(files)
}

struct InitMutation {
    name: String,
    info: Option<PackageInfo>,
    pipeline: Option<Pipeline>,
}

#[async_trait]
impl Mutation for InitMutation {
    fn name(&self) -> &'static str {
        "init"
    }

    async fn apply(&self, mut files: FileSet, _cancel: &CancellationToken) -> Result<FileSet> {
        if files.contains(kpt_core::KPTFILE_NAME) {
            return Err(Error::already_exists("package already has a Kptfile"));
        }
        let mut kf = Kptfile::new(&self.name);
        kf.info = self.info.clone();
        kf.pipeline = self.pipeline.clone();
        kf.validate()?;
        files.insert(kpt_core::KPTFILE_NAME, kf.to_yaml()?);
        Ok(files)
    }
}

struct CloneMutation {
    name: String,
    source: UpstreamSource,
    fetcher: Arc<dyn Fetcher>,
    resolver: Arc<dyn RevisionResolver>,
}

#[async_trait]
impl Mutation for CloneMutation {
    fn name(&self) -> &'static str {
        "clone"
    }

    async fn apply(&self, files: FileSet, cancel: &CancellationToken) -> Result<FileSet> {
        if !files.is_empty() {
            return Err(Error::invalid_param("clone must be the first task of a revision"));
        }
        let mut out = match (&self.source.upstream, &self.source.upstream_ref) {
            (Some(upstream), None) => {
                self.fetcher.validate(upstream)?;
                let fetched = self.fetcher.fetch(upstream, cancel).await?;
                let mut files = fetched.files;
                let mut kf = kptfile_resource(&files)?;
                self.fetcher.apply_upstream(&mut kf, upstream, &fetched.lock)?;
                put_kptfile(&mut files, &kf);
                files
            }
            (None, Some(key)) => resolve_published(self.resolver.as_ref(), key, cancel).await?,
            _ => return Err(Error::invalid_param("clone needs exactly one of upstream and upstreamRef")),
        };
        rename(&mut out, &self.name)?;
        Ok(out)
    }
}

struct EditMutation {
    package: String,
    source: PackageRevisionKey,
    resolver: Arc<dyn RevisionResolver>,
}

#[async_trait]
impl Mutation for EditMutation {
    fn name(&self) -> &'static str {
        "edit"
    }

    async fn apply(&self, files: FileSet, cancel: &CancellationToken) -> Result<FileSet> {
        if !files.is_empty() {
            return Err(Error::invalid_param("edit must be the first task of a revision"));
        }
        if self.source.package != self.package {
            return Err(Error::invalid_param(format!("edit source {} belongs to another package", self.source)));
        }
        resolve_published(self.resolver.as_ref(), &self.source, cancel).await
    }
}

struct EvalMutation {
    function: Function,
    runtime: FnRuntime,
}

#[async_trait]
impl Mutation for EvalMutation {
    fn name(&self) -> &'static str {
        "eval"
    }

    async fn apply(&self, files: FileSet, cancel: &CancellationToken) -> Result<FileSet> {
        let (out, results) = kpt_fnruntime::eval(&self.runtime, &files, &self.function, cancel).await?;
        debug!(function = self.function.display_name(), results = results.len(), "evaluated function");
        Ok(out)
    }
}

struct PatchMutation {
    patches: Vec<kpt_repository::PatchSpec>,
}

#[async_trait]
impl Mutation for PatchMutation {
    fn name(&self) -> &'static str {
        "patch"
    }

    async fn apply(&self, mut files: FileSet, _cancel: &CancellationToken) -> Result<FileSet> {
        apply_patches(&mut files, &self.patches)?;
        Ok(files)
    }
}

/// Merges a new upstream into the draft, using the upstream the draft was
/// last cloned or updated from as the merge base.
struct UpdateMutation {
    origin: UpstreamSource,
    target: UpstreamSource,
    fetcher: Arc<dyn Fetcher>,
    resolver: Arc<dyn RevisionResolver>,
}

impl UpdateMutation {
    async fn origin_files(&self, local: &Kptfile, cancel: &CancellationToken) -> Result<FileSet> {
        match (&self.origin.upstream, &self.origin.upstream_ref) {
            (Some(upstream), _) => match &local.upstream_lock {
                Some(lock) => Ok(self.fetcher.fetch_locked(lock, cancel).await?.files),
                None => Ok(self.fetcher.fetch(upstream, cancel).await?.files),
            },
            (None, Some(key)) => resolve_published(self.resolver.as_ref(), key, cancel).await,
            (None, None) => Ok(FileSet::new()),
        }
    }
}

#[async_trait]
impl Mutation for UpdateMutation {
    fn name(&self) -> &'static str {
        "update"
    }

    async fn apply(&self, local: FileSet, cancel: &CancellationToken) -> Result<FileSet> {
        let kf = kptfile_of(&local)?;
        let strategy = kf.upstream.as_ref().map(|u| u.strategy()).unwrap_or(UpdateStrategy::ResourceMerge);
        let origin = self.origin_files(&kf, cancel).await?;
        check_cancelled(cancel, "engine.update")?;
        let (updated, lock) = match (&self.target.upstream, &self.target.upstream_ref) {
            (Some(upstream), None) => {
                self.fetcher.validate(upstream)?;
                let fetched = self.fetcher.fetch(upstream, cancel).await?;
                (fetched.files, Some((upstream, fetched.lock)))
            }
            (None, Some(key)) => (resolve_published(self.resolver.as_ref(), key, cancel).await?, None),
            _ => return Err(Error::invalid_param("update needs exactly one of upstream and upstreamRef")),
        };
        let outcome = merge_packages(strategy, &origin, &updated, &local)?;
        for w in &outcome.warnings {
            warn!("{}", w);
        }
        let mut files = outcome.files;
        if let Some((upstream, lock)) = lock {
            let mut kres = kptfile_resource(&files)?;
            self.fetcher.apply_upstream(&mut kres, upstream, &lock)?;
            put_kptfile(&mut files, &kres);
        }
        Ok(files)
    }
}

struct RenderMutation {
    runtime: FnRuntime,
}

impl RenderMutation {
    async fn run(&self, files: &FileSet, cancel: &CancellationToken) -> Result<Materialized> {
        let (files, render) = kpt_fnruntime::render(&self.runtime, files, cancel).await?;
        Ok(Materialized { files, render })
    }
}

#[async_trait]
impl Mutation for RenderMutation {
    fn name(&self) -> &'static str {
        "render"
    }

    async fn apply(&self, files: FileSet, cancel: &CancellationToken) -> Result<FileSet> {
        Ok(self.run(&files, cancel).await?.files)
    }
}

#[derive(Clone)]
pub struct TaskExecutor {
    fetcher: Arc<dyn Fetcher>,
    runtime: FnRuntime,
    resolver: Arc<dyn RevisionResolver>,
}

impl TaskExecutor {
    pub fn new(fetcher: Arc<dyn Fetcher>, runtime: FnRuntime, resolver: Arc<dyn RevisionResolver>) -> Self {
        Self { fetcher, runtime, resolver }
    }

    /// The mutation a task maps to. `history` holds the tasks recorded
    /// before it.
    fn mutation(&self, key: &PackageRevisionKey, repo: &RepositoryConfig, task: &Task, history: &[Task]) -> Result<Box<dyn Mutation>> {
        let name = package_name(&key.package).to_string();
        Ok(match task {
            Task::Init { description, keywords, site } => {
                let info = (description.is_some() || !keywords.is_empty() || site.is_some()).then(|| PackageInfo {
                    description: description.clone(),
                    keywords: keywords.clone(),
                    site: site.clone(),
                    ..Default::default()
                });
                let defaults = Pipeline { mutators: repo.spec.mutators.clone(), validators: repo.spec.validators.clone() };
                let pipeline = (!defaults.is_empty()).then_some(defaults);
                Box::new(InitMutation { name, info, pipeline })
            }
            Task::Clone { upstream } => Box::new(CloneMutation {
                name,
                source: upstream.clone(),
                fetcher: self.fetcher.clone(),
                resolver: self.resolver.clone(),
            }),
            Task::Edit { source_ref } => Box::new(EditMutation {
                package: key.package.clone(),
                source: source_ref.clone(),
                resolver: self.resolver.clone(),
            }),
            Task::Eval { function } => {
                function.validate()?;
                Box::new(EvalMutation { function: function.clone(), runtime: self.runtime.clone() })
            }
            Task::Patch { patches } => Box::new(PatchMutation { patches: patches.clone() }),
            Task::Update { upstream } => {
                let origin = history
                    .iter()
                    .rev()
                    .find_map(|t| match t {
                        Task::Clone { upstream } | Task::Update { upstream } => Some(upstream.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| Error::invalid_param("update needs a revision that was cloned from an upstream"))?;
                Box::new(UpdateMutation {
                    origin,
                    target: upstream.clone(),
                    fetcher: self.fetcher.clone(),
                    resolver: self.resolver.clone(),
                })
            }
        })
    }

    async fn step(&self, m: &dyn Mutation, files: FileSet, key: &PackageRevisionKey, cancel: &CancellationToken) -> Result<FileSet> {
        check_cancelled(cancel, "engine.task")?;
        let t0 = Instant::now();
        let out = m.apply(files, cancel).await.map_err(|e| e.with_op(format!("engine.task.{}", m.name())))?;
        counter!("kpt_engine_tasks_total", 1u64, "type" => m.name());
        histogram!("kpt_engine_task_ms", t0.elapsed().as_secs_f64() * 1000.0, "type" => m.name());
        debug!(revision = %key, task = m.name(), files = out.len(), took_ms = %t0.elapsed().as_millis(), "applied task");
        Ok(out)
    }

    pub async fn render(&self, files: &FileSet, cancel: &CancellationToken) -> Result<Materialized> {
        RenderMutation { runtime: self.runtime.clone() }.run(files, cancel).await
    }

    /// Builds the content of a new revision from its tasks.
    pub async fn create(
        &self,
        key: &PackageRevisionKey,
        repo: &RepositoryConfig,
        tasks: &[Task],
        cancel: &CancellationToken,
    ) -> Result<Materialized> {
        let t0 = Instant::now();
        match tasks.first() {
            Some(Task::Init { .. } | Task::Clone { .. } | Task::Edit { .. }) => {}
            Some(other) => {
                return Err(Error::invalid_param(format!("a new revision cannot start with a {} task", other.type_name())).with_op("engine.create"));
            }
            None => return Err(Error::missing_param("a new revision needs at least one task").with_op("engine.create")),
        }
        let mut files = FileSet::new();
        for (i, task) in tasks.iter().enumerate() {
            if is_edit(task) {
                return Err(Error::invalid_param(format!("{} tasks are not allowed when creating a revision", task.type_name())).with_op("engine.create"));
            }
            if i > 0 && matches!(task, Task::Init { .. } | Task::Clone { .. } | Task::Edit { .. }) {
                return Err(Error::invalid_param(format!("{} must be the first task", task.type_name())).with_op("engine.create"));
            }
            let m = self.mutation(key, repo, task, &tasks[..i])?;
            files = self.step(m.as_ref(), files, key, cancel).await?;
        }
        let out = self.render(&files, cancel).await?;
        info!(revision = %key, tasks = tasks.len(), took_ms = %t0.elapsed().as_millis(), "materialized revision");
        Ok(out)
    }

    /// Applies a Patch or Update task to an existing draft's files.
    pub async fn apply(
        &self,
        key: &PackageRevisionKey,
        repo: &RepositoryConfig,
        history: &[Task],
        task: &Task,
        files: FileSet,
        cancel: &CancellationToken,
    ) -> Result<Materialized> {
        if !is_edit(task) {
            return Err(Error::invalid_param(format!("{} tasks can only be recorded when a revision is created", task.type_name())).with_op("engine.update"));
        }
        let m = self.mutation(key, repo, task, history)?;
        let files = self.step(m.as_ref(), files, key, cancel).await?;
        self.render(&files, cancel).await
    }

    /// Rebuilds a revision's content from its task history alone. The tasks
    /// recorded at creation render once as a group; every later edit
    /// renders on its own, matching how the tasks were applied.
    pub async fn replay(
        &self,
        key: &PackageRevisionKey,
        repo: &RepositoryConfig,
        tasks: &[Task],
        cancel: &CancellationToken,
    ) -> Result<FileSet> {
        let render = RenderMutation { runtime: self.runtime.clone() };
        let created = tasks.iter().position(is_edit).unwrap_or(tasks.len());
        let mut files = self.create(key, repo, &tasks[..created], cancel).await?.files;
        for i in created..tasks.len() {
            let m = self.mutation(key, repo, &tasks[i], &tasks[..i])?;
            files = self.step(m.as_ref(), files, key, cancel).await?;
            files = self.step(&render, files, key, cancel).await?;
        }
        Ok(files)
    }
}

/// Tasks appended to an existing draft.
fn is_edit(task: &Task) -> bool {
    matches!(task, Task::Patch { .. } | Task::Update { .. })
}
