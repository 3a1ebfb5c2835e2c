//! Subprocess handler transport.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{debug_log, Handler, HandlerError};
use crate::config::ExecHandlerConfig;
use crate::Result;

/// Handler that spawns a child process per invocation.
///
/// The request body is written to the child's stdin, its stdout is the
/// response body. A non-zero exit status fails the invocation with the
/// child's stderr attached for diagnostics, and a deadline kills the child
/// outright.
#[derive(Debug)]
pub struct ExecHandler {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<String>,
    timeout: Duration,
    debug: bool,
}

impl ExecHandler {
    /// Build a subprocess handler from its configuration.
    pub fn new(config: &ExecHandlerConfig, debug: bool) -> Result<Self> {
        Ok(Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
            timeout: config.timeout()?,
            debug,
        })
    }
}

#[async_trait]
impl Handler for ExecHandler {
    async fn run(&self, request: &[u8]) -> std::result::Result<Vec<u8>, HandlerError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        if self.debug {
            debug_log("exec", "stdin", &String::from_utf8_lossy(request));
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HandlerError::Transport(format!("{}: {e}", self.command)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HandlerError::Transport("failed to open stdin".into()))?;
        stdin
            .write_all(request)
            .await
            .map_err(|e| HandlerError::Transport(format!("failed to write stdin: {e}")))?;
        // Close stdin so handlers reading to EOF can make progress.
        drop(stdin);

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HandlerError::Timeout(self.timeout))?
            .map_err(|e| HandlerError::Transport(e.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if self.debug {
            for line in stderr.lines() {
                debug_log("exec", "stderr", line);
            }
        }

        if !output.status.success() {
            return Err(HandlerError::Failure(format!(
                "{}: {}",
                output.status,
                stderr.trim_end()
            )));
        }

        if self.debug {
            debug_log("exec", "stdout", &String::from_utf8_lossy(&output.stdout));
        }

        if output.stdout.is_empty() {
            return Err(HandlerError::EmptyResponse);
        }

        Ok(output.stdout)
    }
}
