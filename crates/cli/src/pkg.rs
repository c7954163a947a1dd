use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;
use kpt_core::Error;
use kpt_fetch::Fetcher;
use kpt_lifecycle::{GetOptions, InitOptions, Lifecycle, UpdateOptions};
use kpt_merge::{diff_packages, DiffKind};
use kpt_pkg::{kptfile_of, FileSet, UpdateStrategy};
use serde_json::json;

use crate::{upstream_arg, Ctx};

#[derive(Subcommand, Debug)]
pub enum PkgCommand {
    /// Fetch a package from git (`<repo>.git[/<dir>][@<ref>]`, GitHub tree URLs) or OCI (`oci://<image>`)
    Get {
        source: String,
        /// Defaults to the last segment of the source
        destination: Option<PathBuf>,
        /// resource-merge, fast-forward, force-delete-replace or copy-merge
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Merge upstream changes into a local package: `<dir>[@<ref>]`
    Update {
        package: String,
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Create an empty package
    Init {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_delimiter = ',')]
        keywords: Vec<String>,
        #[arg(long)]
        site: Option<String>,
    },
    /// Show local changes against the pinned upstream
    Diff {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Remove a local package directory
    Destroy { dir: PathBuf },
}

fn strategy(s: Option<&str>) -> Result<Option<UpdateStrategy>> {
    Ok(s.map(str::parse).transpose()?)
}

/// `dir@ref`; an `@` inside a path component before the last slash is kept.
fn split_version(arg: &str) -> (PathBuf, Option<String>) {
    match arg.rsplit_once('@') {
        Some((dir, r)) if !r.contains('/') && !dir.is_empty() => (PathBuf::from(dir), Some(r.to_string())),
        _ => (PathBuf::from(arg), None),
    }
}

pub async fn run(ctx: &Ctx, cmd: PkgCommand) -> Result<()> {
    let lifecycle = Lifecycle::new(ctx.fetchers()).with_git(ctx.git());
    match cmd {
        PkgCommand::Get { source, destination, strategy: s } => {
            let (upstream, name) = upstream_arg(&ctx.git(), &source, &ctx.cancel).await?;
            let destination = destination.unwrap_or_else(|| PathBuf::from(name));
            let report = lifecycle.get(GetOptions { upstream, destination, strategy: strategy(s.as_deref())? }, &ctx.cancel).await?;
            let out = json!({
                "destination": report.destination,
                "upstreamLock": report.lock,
                "nested": report.nested,
                "files": report.files,
            });
            ctx.emit(&out, |_| {
                println!("fetched {} files into {}", report.files, report.destination.display());
                for n in &report.nested {
                    println!("  fetched nested package {}", n);
                }
            })?;
        }
        PkgCommand::Update { package, strategy: s } => {
            let (dir, git_ref) = split_version(&package);
            let report = lifecycle.update(UpdateOptions { package: dir.clone(), git_ref, strategy: strategy(s.as_deref())? }, &ctx.cancel).await?;
            let out = json!({
                "strategy": report.strategy.as_str(),
                "upstreamLock": report.lock,
                "warnings": report.warnings,
                "changed": report.changed,
            });
            ctx.emit(&out, |_| {
                for w in &report.warnings {
                    eprintln!("warning: {}", w);
                }
                println!("updated {} ({}): {} files changed", dir.display(), report.strategy, report.changed);
            })?;
        }
        PkgCommand::Init { dir, name, description, keywords, site } => {
            let kf = kpt_lifecycle::init(&dir, &InitOptions { name, description, keywords, site })?;
            ctx.emit(&kf, |kf| println!("initialized package {} in {}", kf.metadata.name, dir.display()))?;
        }
        PkgCommand::Diff { dir } => {
            let local = FileSet::from_dir(&dir)?;
            let lock = kptfile_of(&local)?
                .upstream_lock
                .ok_or_else(|| Error::missing_param("package has no upstream lock to diff against").with_path(&dir).with_op("pkg.diff"))?;
            let origin = ctx.fetchers().fetch_locked(&lock, &ctx.cancel).await?.files;
            let diffs = diff_packages(&origin, &local);
            ctx.emit(&diffs, |diffs| {
                for d in diffs {
                    match d.kind {
                        DiffKind::Added => println!("added {}", d.path),
                        DiffKind::Removed => println!("removed {}", d.path),
                        DiffKind::Modified => print!("{}", d.patch),
                    }
                }
            })?;
        }
        PkgCommand::Destroy { dir } => {
            kpt_lifecycle::destroy(&dir)?;
            ctx.emit(&json!({ "removed": dir }), |_| println!("removed {}", dir.display()))?;
        }
    }
    Ok(())
}
