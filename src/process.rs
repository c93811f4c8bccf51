//! External process invocation.
//!
//! Everything devicegrid does to the outside world (listing devices, booting
//! simulators, launching the automation server, running suites) goes through
//! the [`ProcessRunner`] trait. The orchestration logic only ever sees this
//! narrow interface, so it can be exercised without real devices.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ProcessRunner                          │
//! │                                                              │
//! │  output(Command) ──────────► ExecResult   (run to completion)│
//! │  spawn(Command)  ──────────► ChildProcess (long-running)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Implementation | Module | Description |
//! |----------------|--------|-------------|
//! | Local | [`local`] | Child processes via `tokio::process` |

pub mod local;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

pub use local::LocalProcessRunner;

/// Result type for process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors that can occur while invoking external processes.
///
/// A command that runs and exits non-zero is NOT an error: callers inspect
/// [`ExecResult::exit_code`] for that. These variants describe failures to
/// run or supervise the process at all.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The program could not be started (missing binary, permissions).
    #[error("Failed to spawn `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    /// The command ran longer than its timeout and was killed.
    #[error("Command timed out after {0}s")]
    Timeout(u64),

    /// Waiting on or signalling the process failed.
    #[error("Process supervision failed: {0}")]
    Wait(String),

    /// I/O error while wiring up process output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a spawned process writes its stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Discard all output.
    #[default]
    Null,
    /// Share the orchestrator's terminal.
    Inherit,
    /// Append both streams to a log file.
    File(PathBuf),
}

/// A command to execute on the local machine.
///
/// Commands are built using a fluent builder API. Arguments are passed to
/// the program directly, never through a shell.
///
/// # Example
///
/// ```
/// use devicegrid::process::Command;
///
/// let cmd = Command::new("xcrun")
///     .args(["simctl", "boot"])
///     .arg("8A1C-42")
///     .timeout(60);
///
/// assert_eq!(cmd.program, "xcrun");
/// assert_eq!(cmd.to_shell_string(), "xcrun simctl boot 8A1C-42");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    pub working_dir: Option<PathBuf>,

    /// Environment variables to set for this command.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds for [`ProcessRunner::output`].
    pub timeout_secs: Option<u64>,

    /// Output handling for [`ProcessRunner::spawn`].
    pub output: OutputMode,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
            output: OutputMode::Null,
        }
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the execution timeout in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Sets where a spawned process sends its output.
    pub fn output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    /// Converts the command to a shell-escaped string for logging.
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Result of running a command to completion.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command, `-1` if it was killed by a signal.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A long-running child process, such as the automation server or a suite run.
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, if the process is still known to the OS.
    fn id(&self) -> Option<u32>;

    /// Returns the exit code if the process has already exited.
    fn try_wait(&mut self) -> ProcessResult<Option<i32>>;

    /// Waits for the process to exit and returns its exit code.
    async fn wait(&mut self) -> ProcessResult<i32>;

    /// Forcibly terminates the process and reaps it.
    async fn kill(&mut self) -> ProcessResult<()>;
}

/// Runs external commands.
///
/// Implementations must be shareable across worker tasks.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs a command to completion, capturing its output.
    async fn output(&self, cmd: &Command) -> ProcessResult<ExecResult>;

    /// Starts a command without waiting for it to finish.
    async fn spawn(&self, cmd: &Command) -> ProcessResult<Box<dyn ChildProcess>>;
}

/// Escape a string for display as part of a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | ',' | '='))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_string_quotes_spaces() {
        let cmd = Command::new("echo").arg("hello world").arg("it's");
        assert_eq!(cmd.to_shell_string(), "echo 'hello world' 'it'\\''s'");
    }

    #[test]
    fn test_shell_string_keeps_flags() {
        let cmd = Command::new("adb").args(["-s", "emulator-5554", "shell", "getprop"]);
        assert_eq!(
            cmd.to_shell_string(),
            "adb -s emulator-5554 shell getprop"
        );
    }

    #[test]
    fn test_empty_argument_is_quoted() {
        let cmd = Command::new("run").arg("");
        assert_eq!(cmd.to_shell_string(), "run ''");
    }
}
