use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Subcommand;
use kpt_engine::{CaDEngine, RevisionFilter};
use kpt_pkg::FileSet;
use kpt_repository::{
    ContentType, Lifecycle, PackageRevision, PackageRevisionKey, RepositoryConfig, Task, UpstreamSource,
};
use serde_json::json;

use crate::{upstream_arg, Ctx};

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// Register a git (`--git URL`) or OCI (`--oci REGISTRY`) repository
    Register {
        name: String,
        #[arg(long, conflicts_with = "oci")]
        git: Option<String>,
        #[arg(long, default_value = "main")]
        branch: String,
        #[arg(long, default_value = "")]
        directory: String,
        #[arg(long)]
        oci: Option<String>,
        /// The repository publishes functions rather than packages
        #[arg(long)]
        functions: bool,
    },
    Unregister { name: String },
    List,
}

#[derive(Subcommand, Debug)]
pub enum RpkgCommand {
    #[command(subcommand)]
    Repo(RepoCommand),
    /// List package revisions
    Get {
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        package: Option<String>,
        #[arg(long)]
        workspace: Option<String>,
        /// Draft, Proposed, Published or DeletionProposed
        #[arg(long)]
        lifecycle: Option<String>,
    },
    /// Create a draft of a new, empty package
    Init {
        package: String,
        #[arg(long)]
        repository: String,
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
        #[arg(long)]
        site: Option<String>,
    },
    /// Create a draft from an upstream (git or `oci://` source, or a published `repo:package:workspace`)
    Clone {
        source: String,
        package: String,
        #[arg(long)]
        repository: String,
        #[arg(long)]
        workspace: String,
    },
    /// Create a new draft of a package from one of its published revisions
    Copy {
        source: PackageRevisionKey,
        #[arg(long)]
        workspace: String,
    },
    /// Merge a new upstream into a draft
    Update {
        revision: PackageRevisionKey,
        /// Upstream to move to; same forms as `clone`
        #[arg(long)]
        upstream: String,
    },
    /// Download a revision's files
    Pull { revision: PackageRevisionKey, dir: Option<PathBuf> },
    /// Replace a draft's files with a local directory and render it
    Push { revision: PackageRevisionKey, dir: PathBuf },
    Propose { revision: PackageRevisionKey },
    /// Send a proposed revision back to draft, or keep a published one proposed for deletion
    Reject { revision: PackageRevisionKey },
    Approve { revision: PackageRevisionKey },
    ProposeDelete { revision: PackageRevisionKey },
    Delete { revision: PackageRevisionKey },
    /// Functions published by function repositories
    Functions,
}

async fn engine(ctx: &Ctx) -> Result<CaDEngine> {
    let e = CaDEngine::from_settings(&ctx.settings).with_repositories_file(ctx.settings.cache_dir.join("repositories.yaml"));
    e.load_repositories().await?;
    Ok(e)
}

fn print_revisions(revs: &[PackageRevision]) {
    println!("{:<40} {:<24} {:<10} {:<16}", "NAME", "PACKAGE", "REVISION", "LIFECYCLE");
    for r in revs {
        println!(
            "{:<40} {:<24} {:<10} {:<16}",
            r.key.to_string(),
            r.key.package,
            r.revision_name().unwrap_or_else(|| "-".to_string()),
            r.lifecycle
        );
    }
}

async fn source_of(ctx: &Ctx, arg: &str) -> Result<UpstreamSource> {
    if let Ok(key) = arg.parse::<PackageRevisionKey>() {
        if !arg.contains("://") {
            return Ok(UpstreamSource { upstream: None, upstream_ref: Some(key) });
        }
    }
    let (upstream, _) = upstream_arg(&ctx.git(), arg, &ctx.cancel).await?;
    Ok(UpstreamSource { upstream: Some(upstream), upstream_ref: None })
}

async fn transition(e: &CaDEngine, ctx: &Ctx, key: &PackageRevisionKey, to: impl FnOnce(Lifecycle) -> Result<Lifecycle>) -> Result<PackageRevision> {
    let mut rev = e.get_package_revision(key, &ctx.cancel).await?;
    rev.lifecycle = to(rev.lifecycle)?;
    Ok(e.update_package_revision(&rev, &ctx.cancel).await?)
}

async fn run_with(e: &CaDEngine, ctx: &Ctx, cmd: RpkgCommand) -> Result<()> {
    match cmd {
        RpkgCommand::Repo(RepoCommand::Register { name, git, branch, directory, oci, functions }) => {
            let mut config = match (git, oci) {
                (Some(url), None) => RepositoryConfig::git(&name, &url, &branch, &directory),
                (None, Some(registry)) => RepositoryConfig::oci(&name, &registry),
                _ => bail!("one of --git and --oci is required"),
            };
            if functions {
                config.spec.content = ContentType::Function;
            }
            e.register_repository(config).await?;
            ctx.emit(&json!({ "registered": name }), |_| println!("registered repository {}", name))?;
        }
        RpkgCommand::Repo(RepoCommand::Unregister { name }) => {
            e.unregister_repository(&name).await?;
            ctx.emit(&json!({ "unregistered": name }), |_| println!("unregistered repository {}", name))?;
        }
        RpkgCommand::Repo(RepoCommand::List) => {
            ctx.emit(&e.list_repositories(), |repos| {
                println!("{:<20} {:<6} {:<10} ADDRESS", "NAME", "TYPE", "CONTENT");
                for r in repos {
                    let (kind, addr) = match (&r.spec.git, &r.spec.oci) {
                        (Some(g), _) => ("git", format!("{}@{}/{}", g.repo, g.branch, g.directory)),
                        (None, Some(o)) => ("oci", o.registry.clone()),
                        (None, None) => ("-", String::new()),
                    };
                    println!("{:<20} {:<6} {:<10} {}", r.name(), kind, format!("{:?}", r.spec.content), addr);
                }
            })?;
        }
        RpkgCommand::Get { repository, package, workspace, lifecycle } => {
            let lifecycle = lifecycle.map(|l| l.parse::<Lifecycle>()).transpose()?;
            let filter = RevisionFilter { repository, package, workspace, lifecycle };
            let revs = e.list_package_revisions(&filter, &ctx.cancel).await?;
            ctx.emit(&revs, |revs| print_revisions(revs))?;
        }
        RpkgCommand::Init { package, repository, workspace, description, keywords, site } => {
            let key = PackageRevisionKey::new(&repository, &package, &workspace);
            let rev = PackageRevision::draft(key, vec![Task::Init { description, keywords, site }]);
            let created = e.create_package_revision(&rev, &ctx.cancel).await?;
            ctx.emit(&created, |r| println!("{} created", r.key))?;
        }
        RpkgCommand::Clone { source, package, repository, workspace } => {
            let upstream = source_of(ctx, &source).await?;
            let key = PackageRevisionKey::new(&repository, &package, &workspace);
            let created = e.create_package_revision(&PackageRevision::draft(key, vec![Task::Clone { upstream }]), &ctx.cancel).await?;
            ctx.emit(&created, |r| println!("{} created", r.key))?;
        }
        RpkgCommand::Copy { source, workspace } => {
            let key = PackageRevisionKey::new(&source.repository, &source.package, &workspace);
            let rev = PackageRevision::draft(key, vec![Task::Edit { source_ref: source }]);
            let created = e.create_package_revision(&rev, &ctx.cancel).await?;
            ctx.emit(&created, |r| println!("{} created", r.key))?;
        }
        RpkgCommand::Update { revision, upstream } => {
            let upstream = source_of(ctx, &upstream).await?;
            let mut rev = e.get_package_revision(&revision, &ctx.cancel).await?;
            rev.tasks.push(Task::Update { upstream });
            let updated = e.update_package_revision(&rev, &ctx.cancel).await?;
            ctx.emit(&updated, |r| println!("{} updated", r.key))?;
        }
        RpkgCommand::Pull { revision, dir } => {
            let files = e.get_package_resources(&revision, &ctx.cancel).await?;
            match dir {
                Some(dir) => {
                    files.write_to_dir(&dir)?;
                    ctx.emit(&json!({ "revision": revision.to_string(), "files": files.len() }), |_| {
                        println!("pulled {} files of {} into {}", files.len(), revision, dir.display())
                    })?;
                }
                None => {
                    for (path, body) in files.iter() {
                        println!("# {}\n{}", path, String::from_utf8_lossy(body));
                    }
                }
            }
        }
        RpkgCommand::Push { revision, dir } => {
            let files = FileSet::from_dir(&dir)?;
            let (rev, status) = e.update_package_resources(&revision, &files, &ctx.cancel).await?;
            ctx.emit(&json!({ "revision": rev, "render": status }), |_| {
                for step in &status.steps {
                    println!("[PASS] {}", step.function);
                }
                println!("pushed {} ({} tasks)", rev.key, rev.tasks.len());
            })?;
        }
        RpkgCommand::Propose { revision } => {
            let rev = transition(e, ctx, &revision, |_| Ok(Lifecycle::Proposed)).await?;
            ctx.emit(&rev, |r| println!("{} proposed", r.key))?;
        }
        RpkgCommand::Reject { revision } => {
            let rev = transition(e, ctx, &revision, |from| match from {
                Lifecycle::Proposed => Ok(Lifecycle::Draft),
                Lifecycle::DeletionProposed => Ok(Lifecycle::Published),
                other => bail!("cannot reject a {} revision", other),
            })
            .await?;
            ctx.emit(&rev, |r| println!("{} rejected", r.key))?;
        }
        RpkgCommand::Approve { revision } => {
            let rev = e.approve_package_revision(&revision, &ctx.cancel).await?;
            ctx.emit(&rev, |r| println!("{} approved as {}", r.key, r.revision_name().unwrap_or_default()))?;
        }
        RpkgCommand::ProposeDelete { revision } => {
            let rev = transition(e, ctx, &revision, |_| Ok(Lifecycle::DeletionProposed)).await?;
            ctx.emit(&rev, |r| println!("{} proposed for deletion", r.key))?;
        }
        RpkgCommand::Delete { revision } => {
            e.delete_package_revision(&revision, &ctx.cancel).await?;
            ctx.emit(&json!({ "deleted": revision.to_string() }), |_| println!("{} deleted", revision))?;
        }
        RpkgCommand::Functions => {
            let fns = e.list_functions(&ctx.cancel).await?;
            ctx.emit(&fns, |fns| {
                for f in fns {
                    println!("{:<40} {:<60} {}", f.name, f.image, f.description);
                }
            })?;
        }
    }
    Ok(())
}

pub async fn run(ctx: &Ctx, cmd: RpkgCommand) -> Result<()> {
    let e = engine(ctx).await?;
    let result = run_with(&e, ctx, cmd).await;
    e.close().await;
    result
}
