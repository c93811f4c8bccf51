//! Local process runner implementation.
//!
//! Runs commands as child processes of devicegrid itself using
//! `tokio::process`. This is the runner used outside of tests.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Captured output | `output()` pipes stdout and stderr |
//! | Timeouts | `output()` kills the child when `timeout_secs` elapses |
//! | Long-running children | `spawn()`, killed on drop |

use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{
    ChildProcess, Command, ExecResult, OutputMode, ProcessError, ProcessResult, ProcessRunner,
};

/// Runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessRunner;

impl LocalProcessRunner {
    /// Creates a new local runner.
    pub fn new() -> Self {
        Self
    }

    fn build(cmd: &Command) -> tokio::process::Command {
        let mut process = tokio::process::Command::new(&cmd.program);
        process.args(&cmd.args);

        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }

        process.stdin(Stdio::null());
        process
    }

    fn spawn_error(cmd: &Command, e: std::io::Error) -> ProcessError {
        ProcessError::Spawn {
            program: cmd.program.clone(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn output(&self, cmd: &Command) -> ProcessResult<ExecResult> {
        let start = Instant::now();
        debug!("exec: {}", cmd.to_shell_string());

        let mut process = Self::build(cmd);
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let child = process.spawn().map_err(|e| Self::spawn_error(cmd, e))?;

        let output = if let Some(timeout) = cmd.timeout_secs {
            tokio::time::timeout(Duration::from_secs(timeout), child.wait_with_output())
                .await
                .map_err(|_| ProcessError::Timeout(timeout))?
                .map_err(|e| ProcessError::Wait(e.to_string()))?
        } else {
            child
                .wait_with_output()
                .await
                .map_err(|e| ProcessError::Wait(e.to_string()))?
        };

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    async fn spawn(&self, cmd: &Command) -> ProcessResult<Box<dyn ChildProcess>> {
        debug!("spawn: {}", cmd.to_shell_string());

        let mut process = Self::build(cmd);
        match &cmd.output {
            OutputMode::Null => {
                process.stdout(Stdio::null());
                process.stderr(Stdio::null());
            }
            OutputMode::Inherit => {
                process.stdout(Stdio::inherit());
                process.stderr(Stdio::inherit());
            }
            OutputMode::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                let err_file = file.try_clone()?;
                process.stdout(Stdio::from(file));
                process.stderr(Stdio::from(err_file));
            }
        }
        process.kill_on_drop(true);

        let child = process.spawn().map_err(|e| Self::spawn_error(cmd, e))?;
        Ok(Box::new(LocalChild { child }))
    }
}

/// A child process started by [`LocalProcessRunner::spawn`].
struct LocalChild {
    child: tokio::process::Child,
}

#[async_trait]
impl ChildProcess for LocalChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> ProcessResult<Option<i32>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| ProcessError::Wait(e.to_string()))?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    async fn wait(&mut self) -> ProcessResult<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::Wait(e.to_string()))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> ProcessResult<()> {
        self.child
            .kill()
            .await
            .map_err(|e| ProcessError::Wait(e.to_string()))
    }
}
