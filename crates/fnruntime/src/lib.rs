//! kpt function runtime: runs KRM functions through interchangeable runners
//! (in-process, exec, evaluator sidecar, evaluator pods) and evaluates a
//! package's Kptfile pipeline.

#![forbid(unsafe_code)]

pub mod builtin;
pub mod exec;
pub mod grpc;
pub mod pod;
pub mod render;
pub mod resourcelist;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kpt_core::config::Settings;
use kpt_core::{CancellationToken, Error, ErrorKind, Result};
use kpt_pkg::Function;
use metrics::{counter, histogram};
use tracing::{debug, info};

pub use builtin::BuiltinRunner;
pub use exec::ExecRunner;
pub use grpc::GrpcRunner;
pub use pod::PodRunner;
pub use render::{eval, render, RenderStatus, StepResult};
pub use resourcelist::{FnResult, ResourceList, Severity};

/// What a runner needs to know about one function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionSpec {
    pub image: Option<String>,
    pub exec: Option<String>,
    pub network: bool,
    pub mounts: Vec<String>,
}

impl FunctionSpec {
    pub fn image(image: &str) -> Self {
        Self { image: Some(image.to_string()), ..Default::default() }
    }

    pub fn exec(command: &str) -> Self {
        Self { exec: Some(command.to_string()), ..Default::default() }
    }

    pub fn display_name(&self) -> &str {
        self.image.as_deref().or(self.exec.as_deref()).unwrap_or("<unnamed>")
    }
}

impl From<&Function> for FunctionSpec {
    fn from(f: &Function) -> Self {
        Self { image: f.image.clone(), exec: f.exec.clone(), ..Default::default() }
    }
}

/// Runs one function over a serialized ResourceList.
#[async_trait]
pub trait FunctionRunner: Send + Sync {
    async fn run(&self, func: &FunctionSpec, input: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Builtins first; anything they do not know goes to the fallback.
pub struct DelegatingRunner {
    builtin: BuiltinRunner,
    fallback: Option<Arc<dyn FunctionRunner>>,
    exec: ExecRunner,
}

impl DelegatingRunner {
    pub fn new(builtin: BuiltinRunner, fallback: Option<Arc<dyn FunctionRunner>>) -> Self {
        Self { builtin, fallback, exec: ExecRunner::new() }
    }

    /// Builtins, then the evaluator sidecar when one is configured.
    pub fn from_settings(settings: &Settings) -> Self {
        let fallback = settings
            .fn_evaluator_addr
            .as_deref()
            .map(|addr| Arc::new(GrpcRunner::new(addr)) as Arc<dyn FunctionRunner>);
        Self::new(BuiltinRunner::new(), fallback)
    }
}

#[async_trait]
impl FunctionRunner for DelegatingRunner {
    async fn run(&self, func: &FunctionSpec, input: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>> {
        if func.exec.is_some() {
            return self.exec.run(func, input, cancel).await;
        }
        match self.builtin.run(func, input, cancel).await {
            Err(e) if e.is(ErrorKind::UnsupportedFunction) => match &self.fallback {
                Some(next) => {
                    debug!(function = func.display_name(), "not builtin; delegating");
                    next.run(func, input, cancel).await
                }
                None => Err(e),
            },
            other => other,
        }
    }

    async fn close(&self) -> Result<()> {
        match &self.fallback {
            Some(next) => next.close().await,
            None => Ok(()),
        }
    }
}

type Script = Box<dyn Fn(&mut ResourceList) -> Result<()> + Send + Sync>;

/// Test runner whose functions are closures keyed by image or exec string.
/// Every call is recorded.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: BTreeMap<String, Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut ResourceList) -> Result<()> + Send + Sync + 'static,
    {
        self.scripts.insert(name.to_string(), Box::new(f));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FunctionRunner for ScriptedRunner {
    async fn run(&self, func: &FunctionSpec, input: &[u8], _cancel: &CancellationToken) -> Result<Vec<u8>> {
        let name = func.display_name().to_string();
        if let Ok(mut c) = self.calls.lock() {
            c.push(name.clone());
        }
        let script = self
            .scripts
            .get(&name)
            .ok_or_else(|| Error::unsupported_function(format!("no script for {}", name)))?;
        let text = String::from_utf8_lossy(input);
        let mut list = ResourceList::decode(&text)?;
        script(&mut list)?;
        Ok(list.encode()?.into_bytes())
    }
}

/// A runner plus the per-call deadline.
#[derive(Clone)]
pub struct FnRuntime {
    runner: Arc<dyn FunctionRunner>,
    timeout: Duration,
}

impl FnRuntime {
    pub fn new(runner: Arc<dyn FunctionRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(Arc::new(DelegatingRunner::from_settings(settings)), settings.fn_timeout)
    }

    pub fn runner(&self) -> &Arc<dyn FunctionRunner> {
        &self.runner
    }

    /// Runs `func` over `list` and decodes its answer. Results are returned
    /// as reported; callers decide whether error results fail the step.
    pub async fn run(&self, func: &FunctionSpec, list: &ResourceList, cancel: &CancellationToken) -> Result<ResourceList> {
        let t0 = Instant::now();
        let input = list.encode()?;
        let name = func.display_name().to_string();
        let out = match tokio::time::timeout(self.timeout, self.runner.run(func, input.as_bytes(), cancel)).await {
            Ok(out) => out,
            Err(_) => {
                counter!("kpt_fn_runs_total", 1u64, "outcome" => "timeout");
                return Err(Error::internal(format!("function {} timed out after {:?}", name, self.timeout)).with_op("fn.run"));
            }
        };
        let bytes = out.map_err(|e| {
            counter!("kpt_fn_runs_total", 1u64, "outcome" => "error");
            e
        })?;
        let text = std::str::from_utf8(&bytes).map_err(|e| Error::parse(format!("function {} output is not utf-8: {}", name, e)))?;
        let decoded = ResourceList::decode(text).map_err(|e| e.with_op("fn.run"))?;
        histogram!("kpt_fn_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("kpt_fn_runs_total", 1u64, "outcome" => "ok");
        info!(function = %name, items = decoded.items.len(), results = decoded.results.len(), took_ms = %t0.elapsed().as_millis(), "function ran");
        Ok(decoded)
    }
}
