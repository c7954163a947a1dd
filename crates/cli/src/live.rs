use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Subcommand;
use kpt_apply::{ActionKind, Applier, ApplyOptions, ApplyReport, InventoryPolicy, KubeCluster};
use kpt_lifecycle::InventoryOptions;

use crate::Ctx;

#[derive(Subcommand, Debug)]
pub enum LiveCommand {
    /// Bind a package to a cluster inventory
    Init {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        namespace: Option<String>,
        /// Inventory object name; generated when unset
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "inventory-id")]
        inventory_id: Option<String>,
        /// Replace an inventory that is already set
        #[arg(long)]
        force: bool,
    },
    /// Apply a package, pruning objects it no longer contains
    Apply {
        #[arg(default_value = ".")]
        dir: PathBuf,
        /// strict or adopt
        #[arg(long = "inventory-policy", default_value = "strict")]
        policy: String,
        /// Server-side dry run; reports field-level differences only
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Delete everything a package's inventory records, then the inventory
    Destroy {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

fn print_report(report: &ApplyReport) {
    for a in &report.actions {
        let s = &a.summary;
        if report.dry_run && a.kind == ActionKind::Configured {
            println!("{} {} (+{} ~{} -{})", a.id, a.kind, s.adds, s.updates, s.removes);
        } else {
            println!("{} {}", a.id, a.kind);
        }
    }
    let suffix = if report.dry_run { " (dry run)" } else { "" };
    println!(
        "{} created, {} configured, {} unchanged, {} pruned, {} deleted, {} skipped{}",
        report.count(ActionKind::Created),
        report.count(ActionKind::Configured),
        report.count(ActionKind::Unchanged),
        report.count(ActionKind::Pruned),
        report.count(ActionKind::Deleted),
        report.count(ActionKind::Skipped),
        suffix
    );
}

async fn applier() -> Result<Applier> {
    Ok(Applier::new(Arc::new(KubeCluster::connect().await?)))
}

pub async fn run(ctx: &Ctx, cmd: LiveCommand) -> Result<()> {
    match cmd {
        LiveCommand::Init { dir, namespace, name, inventory_id, force } => {
            let inv = kpt_lifecycle::init_inventory(&dir, &InventoryOptions { namespace, name, inventory_id, force })?;
            ctx.emit(&inv, |inv| {
                println!(
                    "initialized inventory {}/{} ({})",
                    inv.namespace.as_deref().unwrap_or_default(),
                    inv.name.as_deref().unwrap_or_default(),
                    inv.inventory_id.as_deref().unwrap_or_default()
                )
            })?;
        }
        LiveCommand::Apply { dir, policy, dry_run } => {
            let policy: InventoryPolicy = policy.parse()?;
            let report = applier().await?.apply(&dir, ApplyOptions { policy, dry_run }, &ctx.cancel).await?;
            ctx.emit(&report, print_report)?;
        }
        LiveCommand::Destroy { dir } => {
            let report = applier().await?.destroy(&dir, &ctx.cancel).await?;
            ctx.emit(&report, print_report)?;
        }
    }
    Ok(())
}
