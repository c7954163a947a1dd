use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use kpt_fnruntime::{BuiltinRunner, DelegatingRunner, FnRuntime, PodRunner};
use kpt_pkg::{FileSet, Function};
use serde_json::json;

use crate::Ctx;

#[derive(Args, Debug, Clone, Copy)]
pub struct RunnerArgs {
    /// Run image functions in evaluator pods of the current cluster
    #[arg(long)]
    pods: bool,
}

#[derive(Subcommand, Debug)]
pub enum FnCommand {
    /// Run the Kptfile pipelines of a package and its subpackages
    Render {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        runner: RunnerArgs,
    },
    /// Run one function over a package: `kpt fn eval DIR --image IMG -- key=value...`
    Eval {
        #[arg(default_value = ".")]
        dir: PathBuf,
        #[arg(long, conflicts_with = "exec")]
        image: Option<String>,
        #[arg(long)]
        exec: Option<String>,
        /// Path of a function config inside the package
        #[arg(long = "fn-config")]
        fn_config: Option<String>,
        #[command(flatten)]
        runner: RunnerArgs,
        /// key=value pairs passed as a ConfigMap
        #[arg(last = true)]
        config: Vec<String>,
    },
}

async fn runtime(ctx: &Ctx, args: RunnerArgs) -> Result<FnRuntime> {
    if !args.pods {
        return Ok(FnRuntime::from_settings(&ctx.settings));
    }
    let client = kpt_kubehub::get_kube_client().await.map_err(|e| kpt_kubehub::map_anyhow("fn.pod", e))?;
    let pods = PodRunner::new(client, &ctx.settings.fn_pod_namespace, ctx.settings.fn_pod_port);
    let runner = DelegatingRunner::new(BuiltinRunner::new(), Some(Arc::new(pods)));
    Ok(FnRuntime::new(Arc::new(runner), ctx.settings.fn_timeout))
}

fn config_map(pairs: &[String]) -> Result<Option<BTreeMap<String, String>>> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut out = BTreeMap::new();
    for p in pairs {
        match p.split_once('=') {
            Some((k, v)) if !k.is_empty() => {
                out.insert(k.to_string(), v.to_string());
            }
            _ => bail!("function config {:?} is not key=value", p),
        }
    }
    Ok(Some(out))
}

pub async fn run(ctx: &Ctx, cmd: FnCommand) -> Result<()> {
    match cmd {
        FnCommand::Render { dir, runner } => {
            let rt = runtime(ctx, runner).await?;
            let files = FileSet::from_dir(&dir)?;
            let (out, status) = kpt_fnruntime::render(&rt, &files, &ctx.cancel).await?;
            out.sync_to_dir(&dir, &files)?;
            ctx.emit(&status, |status| {
                for step in &status.steps {
                    let pkg = if step.package.is_empty() { "." } else { step.package.as_str() };
                    println!("[PASS] {} in {}", step.function, pkg);
                    for r in &step.results {
                        println!("  {}", r);
                    }
                }
                println!("successfully rendered {}", dir.display());
            })?;
        }
        FnCommand::Eval { dir, image, exec, fn_config, runner, config } => {
            if image.is_none() && exec.is_none() {
                bail!("one of --image and --exec is required");
            }
            let function = Function { image, exec, name: None, config_map: config_map(&config)?, config_path: fn_config };
            function.validate()?;
            let rt = runtime(ctx, runner).await?;
            let files = FileSet::from_dir(&dir)?;
            let (out, results) = kpt_fnruntime::eval(&rt, &files, &function, &ctx.cancel).await?;
            out.sync_to_dir(&dir, &files)?;
            ctx.emit(&json!({ "function": function.display_name(), "results": results }), |_| {
                println!("[PASS] {}", function.display_name());
                for r in &results {
                    println!("  {}", r);
                }
            })?;
        }
    }
    Ok(())
}
