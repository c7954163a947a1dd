mod func;
mod live;
mod pkg;
mod rpkg;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use kpt_core::config::Settings;
use kpt_core::{CancellationToken, ImageRef};
use kpt_fetch::{resolve_git_arg, Fetchers, GitCli};
use kpt_pkg::Upstream;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kpt", version, about = "Kubernetes configuration packages: fetch, update, render, apply and orchestrate")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch, update, create and remove local packages
    #[command(subcommand)]
    Pkg(pkg::PkgCommand),
    /// Run KRM functions over a local package
    #[command(name = "fn", subcommand)]
    Function(func::FnCommand),
    /// Apply packages to a cluster and track what they own
    #[command(subcommand)]
    Live(live::LiveCommand),
    /// Manage package revisions in registered repositories
    #[command(subcommand)]
    Rpkg(rpkg::RpkgCommand),
}

/// What every command gets.
pub struct Ctx {
    pub settings: Settings,
    pub cancel: CancellationToken,
    pub output: Output,
}

impl Ctx {
    pub fn git(&self) -> Arc<GitCli> {
        Arc::new(GitCli::from_settings(&self.settings))
    }

    pub fn fetchers(&self) -> Arc<Fetchers> {
        Arc::new(Fetchers::from_settings(&self.settings))
    }

    /// Prints `value` as JSON, or runs `human` for the default format.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> Result<()> {
        match self.output {
            Output::Human => human(value),
            Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        }
        Ok(())
    }
}

/// Turns a source argument into an upstream and the directory name it
/// lands in by default: `oci://<image>` or any git form `pkg get` accepts.
pub async fn upstream_arg(git: &GitCli, arg: &str, cancel: &CancellationToken) -> Result<(Upstream, String)> {
    if let Some(image) = arg.strip_prefix("oci://") {
        let name = ImageRef::parse(image)?.short_name().to_string();
        return Ok((Upstream::oci(image), name));
    }
    let g = resolve_git_arg(git, arg, cancel).await?;
    let name = g.default_destination();
    Ok((Upstream::git(&g.repo, &g.directory, &g.git_ref), name))
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        warn!(addr = %addr, "invalid KPT_METRICS_ADDR; expected host:port");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env();
    init_tracing(&settings.log);
    init_metrics(settings.metrics_addr.as_deref());
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; cancelling");
                cancel.cancel();
            }
        }
    });

    let ctx = Ctx { settings, cancel, output: cli.output };
    let result = match cli.command {
        Commands::Pkg(cmd) => pkg::run(&ctx, cmd).await,
        Commands::Function(cmd) => func::run(&ctx, cmd).await,
        Commands::Live(cmd) => live::run(&ctx, cmd).await,
        Commands::Rpkg(cmd) => rpkg::run(&ctx, cmd).await,
    };
    if let Err(e) = &result {
        if let Some(err) = e.downcast_ref::<kpt_core::Error>() {
            for c in err.conflicts() {
                eprintln!("conflict in {}:\n{}", c.file, c.diff);
            }
        }
        error!(error = %e, "command failed");
    }
    result
}
