//! Suite execution on a single device.
//!
//! The coordinator hands each device's run to a [`SuiteRunner`] together
//! with a [`RunParameters`] bag. [`CommandSuiteRunner`] runs the configured
//! suite command with the parameters substituted and exported.
//!
//! # Parameters
//!
//! | Key | Example |
//! |-----|---------|
//! | `deviceId` | `emulator-5554`, simulator UDID |
//! | `platform` | `android`, `ios` |
//! | `deviceName` | `Pixel 7`, `iPhone 15` |
//! | `osVersion` | `14`, `17.0` |
//! | `port` | `4724` |
//! | `serverUrl` | `http://127.0.0.1:4723` |
//!
//! Suite parameters from the config are merged in first; the device keys
//! above win on conflict.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SuiteConfig;
use crate::data::CachedDataStore;
use crate::process::{Command, OutputMode, ProcessRunner};

/// Environment variable prefix for exported parameters.
pub const ENV_PREFIX: &str = "DEVICEGRID_";

/// The suite to run on every device.
#[derive(Debug, Clone)]
pub struct SuiteDescriptor {
    pub name: String,
    pub command: String,
    pub parameters: BTreeMap<String, String>,
    pub skip_exit_code: i32,
    pub working_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

impl SuiteDescriptor {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            parameters: BTreeMap::new(),
            skip_exit_code: 3,
            working_dir: None,
            log_dir: None,
        }
    }

    /// Retry identity of this suite on a device.
    pub fn identity(&self, device_id: &str) -> String {
        format!("{}@{}", self.name, device_id)
    }
}

impl From<&SuiteConfig> for SuiteDescriptor {
    fn from(config: &SuiteConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            parameters: config.parameters.clone(),
            skip_exit_code: config.skip_exit_code,
            working_dir: config.working_dir.clone(),
            log_dir: config.log_dir.clone(),
        }
    }
}

/// Named string parameters handed to one device run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParameters(BTreeMap<String, String>);

impl RunParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replaces `{key}` tokens with parameter values. Unknown tokens are kept.
    pub fn substitute(&self, text: &str) -> String {
        self.0.iter().fold(text.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        })
    }

    /// Parameters as `DEVICEGRID_<UPPER_SNAKE>` environment variables.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, upper_snake(k)), v.clone()))
            .collect()
    }
}

impl FromIterator<(String, String)> for RunParameters {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// `deviceName` -> `DEVICE_NAME`, `app-path` -> `APP_PATH`.
fn upper_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push('_');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
    }
    out
}

/// Result of one run of a suite on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    Skipped,
    Failed(String),
}

/// Runs a suite on one device.
#[async_trait]
pub trait SuiteRunner: Send + Sync {
    /// Runs the suite once. Implementations stop early when `cancel` fires.
    ///
    /// An `Err` means the run could not be carried out at all and is
    /// treated like a failed run.
    async fn run(
        &self,
        suite: &SuiteDescriptor,
        params: &RunParameters,
        cancel: CancellationToken,
    ) -> Result<RunOutcome>;
}

/// Runs the suite as an external command.
///
/// The command line is split with shell quoting rules, then `{key}` and
/// `{data:<testCase>.<field>}` placeholders are substituted inside each word,
/// so a value never spans or breaks argument boundaries. The command is
/// spawned directly. Exit code 0 passes, the suite's skip code skips,
/// anything else fails.
pub struct CommandSuiteRunner {
    process: Arc<dyn ProcessRunner>,
    data: Option<Arc<CachedDataStore>>,
}

impl CommandSuiteRunner {
    pub fn new(process: Arc<dyn ProcessRunner>) -> Self {
        Self {
            process,
            data: None,
        }
    }

    /// Enables `{data:..}` placeholder expansion.
    pub fn with_data(mut self, data: Arc<CachedDataStore>) -> Self {
        self.data = Some(data);
        self
    }

    async fn build_command(
        &self,
        suite: &SuiteDescriptor,
        params: &RunParameters,
    ) -> Result<Command> {
        let words = shell_words::split(&suite.command)
            .with_context(|| format!("Invalid suite command: {}", suite.command))?;

        let mut expanded = Vec::with_capacity(words.len());
        for word in &words {
            let mut word = params.substitute(word);
            if let Some(data) = &self.data {
                word = data.expand_placeholders(&word).await;
            }
            expanded.push(word);
        }
        let (program, args) = expanded
            .split_first()
            .context("Suite command is empty")?;

        let mut cmd = Command::new(program).args(args);
        for (key, value) in params.env_vars() {
            cmd = cmd.env(key, value);
        }
        if let Some(dir) = &suite.working_dir {
            cmd = cmd.working_dir(dir);
        }
        cmd = match &suite.log_dir {
            Some(dir) => cmd.output(OutputMode::File(dir.join(log_file_name(suite, params)))),
            None => cmd.output(OutputMode::Inherit),
        };
        Ok(cmd)
    }
}

fn log_file_name(suite: &SuiteDescriptor, params: &RunParameters) -> String {
    let device = params.get("deviceId").unwrap_or("device");
    let safe = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    };
    format!("{}-{}.log", safe(&suite.name), safe(device))
}

#[async_trait]
impl SuiteRunner for CommandSuiteRunner {
    async fn run(
        &self,
        suite: &SuiteDescriptor,
        params: &RunParameters,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let cmd = self.build_command(suite, params).await?;
        debug!("Suite command: {}", cmd.to_shell_string());

        let mut child = self
            .process
            .spawn(&cmd)
            .await
            .with_context(|| format!("Failed to start suite {}", suite.name))?;

        let waited = tokio::select! {
            code = child.wait() => Some(code),
            _ = cancel.cancelled() => None,
        };

        let Some(code) = waited else {
            info!(
                "Cancelling suite {} on {}",
                suite.name,
                params.get("deviceId").unwrap_or("?")
            );
            child.kill().await.context("Failed to kill cancelled suite")?;
            return Ok(RunOutcome::Failed("cancelled".to_string()));
        };

        let code = code.context("Failed to wait for suite")?;
        Ok(if code == 0 {
            RunOutcome::Passed
        } else if code == suite.skip_exit_code {
            RunOutcome::Skipped
        } else {
            RunOutcome::Failed(format!("exit code {}", code))
        })
    }
}
