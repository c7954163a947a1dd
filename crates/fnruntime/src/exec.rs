//! Runs a local executable with the ResourceList on stdin and stdout.

use std::process::Stdio;

use async_trait::async_trait;
use kpt_core::{CancellationToken, Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{FunctionRunner, FunctionSpec};

#[derive(Debug, Clone, Default)]
pub struct ExecRunner;

impl ExecRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FunctionRunner for ExecRunner {
    async fn run(&self, func: &FunctionSpec, input: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>> {
        let exec = func
            .exec
            .as_deref()
            .ok_or_else(|| Error::unsupported_function("exec runner needs an exec command").with_op("fn.exec"))?;
        if func.network || !func.mounts.is_empty() {
            return Err(Error::invalid_param("network access and mounts are not supported for exec functions").with_op("fn.exec"));
        }
        let mut parts = exec.split_whitespace();
        let program = parts.next().ok_or_else(|| Error::missing_param("exec command is empty").with_op("fn.exec"))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::from(e).with_op("fn.exec"))?;
        if let Some(mut stdin) = child.stdin.take() {
            let payload = input.to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&payload).await;
            });
        }
        let output = tokio::select! {
            out = child.wait_with_output() => out.map_err(|e| Error::from(e).with_op("fn.exec"))?,
            _ = cancel.cancelled() => return Err(Error::internal("cancelled").with_op("fn.exec")),
        };
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            // Functions report failures in their results; keep stdout when present.
            if !output.stdout.is_empty() {
                debug!(exec, status = ?output.status.code(), "function exited non-zero with output");
                return Ok(output.stdout);
            }
            return Err(Error::internal(format!("{} exited with {}: {}", exec, output.status, stderr.trim())).with_op("fn.exec"));
        }
        if !stderr.trim().is_empty() {
            debug!(exec, stderr = %stderr.trim(), "function stderr");
        }
        Ok(output.stdout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipes_stdin_to_stdout() {
        let spec = FunctionSpec { exec: Some("cat".into()), ..Default::default() };
        let out = ExecRunner::new().run(&spec, b"kind: ResourceList\n", &CancellationToken::new()).await.unwrap();
        assert_eq!(out, b"kind: ResourceList\n");
    }

    #[tokio::test]
    async fn failing_command_without_output_is_an_error() {
        let spec = FunctionSpec { exec: Some("false".into()), ..Default::default() };
        let err = ExecRunner::new().run(&spec, b"", &CancellationToken::new()).await.unwrap_err();
        assert!(err.is(kpt_core::ErrorKind::Internal));
    }

    #[tokio::test]
    async fn network_is_refused() {
        let spec = FunctionSpec { exec: Some("cat".into()), network: true, ..Default::default() };
        assert!(ExecRunner::new().run(&spec, b"", &CancellationToken::new()).await.is_err());
    }
}
