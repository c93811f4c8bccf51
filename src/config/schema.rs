//! Configuration schema definitions for devicegrid.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── OrchestratorConfig   - Platforms, retries, suite timeout
//! ├── ServerConfig         - Automation server binary, bind address, liveness
//! ├── DeviceConfig         - Boot timeouts, port range
//! ├── SuiteConfig          - Command run once per device, shared parameters
//! └── DataConfig           - Test-data file backing the cache
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::device::Platform;

/// Root configuration structure for devicegrid.
///
/// # TOML Structure
///
/// ```toml
/// [orchestrator]
/// platforms = ["android", "ios"]
/// retry_count = 3
///
/// [server]
/// binary = "appium"
/// port = 4723
///
/// [devices]
/// boot_timeout_secs = 120
///
/// [suite]
/// name = "login"
/// command = "mvn test -Dudid={deviceId} -Dport={port}"
///
/// [data]
/// path = "testdata/testdata.json"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core orchestration settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Automation server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Device discovery, boot and port settings.
    #[serde(default)]
    pub devices: DeviceConfig,

    /// The suite to run on every device.
    pub suite: SuiteConfig,

    /// Test-data source (optional).
    #[serde(default)]
    pub data: DataConfig,
}

impl Config {
    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.platforms.is_empty() {
            bail!("orchestrator.platforms must name at least one platform");
        }
        if self.devices.port_range_start > self.devices.port_range_end {
            bail!(
                "devices.port_range_start ({}) must not exceed devices.port_range_end ({})",
                self.devices.port_range_start,
                self.devices.port_range_end
            );
        }
        if (self.devices.port_range_start..=self.devices.port_range_end)
            .contains(&self.server.port)
        {
            bail!(
                "server port {} overlaps the device port range {}-{}",
                self.server.port,
                self.devices.port_range_start,
                self.devices.port_range_end
            );
        }
        if self.server.liveness_attempts == 0 {
            bail!("server.liveness_attempts must be at least 1");
        }
        if self.suite.command.trim().is_empty() {
            bail!("suite.command must not be empty");
        }
        if self.orchestrator.max_devices == Some(0) {
            bail!("orchestrator.max_devices must be at least 1 when set");
        }
        Ok(())
    }
}

/// Core orchestration settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `platforms` | `["android", "ios"]` |
/// | `retry_count` | 3 |
/// | `suite_timeout_secs` | 1800 (30 minutes) |
/// | `max_devices` | None (use every device) |
/// | `start_server` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Platforms to discover devices for.
    #[serde(default = "default_platforms")]
    pub platforms: Vec<Platform>,

    /// Maximum retries per test identity after a failed run.
    ///
    /// Set to 0 to disable retries.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// How long to wait for all device runs before abandoning them.
    #[serde(default = "default_suite_timeout")]
    pub suite_timeout_secs: u64,

    /// Upper bound on devices used in one run.
    ///
    /// `1` gives the single-device flow: a pool of size one.
    pub max_devices: Option<usize>,

    /// Whether to launch the local automation server.
    ///
    /// Disable when the server is managed externally.
    #[serde(default = "default_true")]
    pub start_server: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            platforms: default_platforms(),
            retry_count: default_retry_count(),
            suite_timeout_secs: default_suite_timeout(),
            max_devices: None,
            start_server: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn suite_timeout(&self) -> Duration {
        Duration::from_secs(self.suite_timeout_secs)
    }
}

fn default_platforms() -> Vec<Platform> {
    vec![Platform::Android, Platform::Ios]
}

fn default_retry_count() -> u32 {
    3
}

fn default_suite_timeout() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

/// Automation server settings.
///
/// The server is launched as
/// `{binary} --address {address} --port {port} --relaxed-security ...`.
///
/// # Example
///
/// ```toml
/// [server]
/// binary = "/usr/local/bin/appium"
/// address = "127.0.0.1"
/// port = 4723
/// log_file = "logs/appium.log"
/// liveness_attempts = 5
/// liveness_interval_ms = 1000
/// plugins = ["gestures", "images"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server executable. `~` and environment variables are expanded.
    #[serde(default = "default_server_binary")]
    pub binary: String,

    /// Bind address, also used by the liveness check.
    #[serde(default = "default_address")]
    pub address: String,

    /// Bind port, also the default device port in single-device mode.
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Optional URL base path such as `/wd/hub`.
    pub base_path: Option<String>,

    /// Number of liveness checks before giving up.
    #[serde(default = "default_liveness_attempts")]
    pub liveness_attempts: u32,

    /// Delay between liveness checks in milliseconds.
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_ms: u64,

    /// Drivers to enable.
    #[serde(default = "default_drivers")]
    pub drivers: Vec<String>,

    /// Plugins to enable.
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,

    /// File receiving the server's output. Discarded when unset.
    pub log_file: Option<PathBuf>,

    /// Extra arguments appended after the fixed flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: default_server_binary(),
            address: default_address(),
            port: default_server_port(),
            base_path: None,
            liveness_attempts: default_liveness_attempts(),
            liveness_interval_ms: default_liveness_interval(),
            drivers: default_drivers(),
            plugins: default_plugins(),
            log_file: None,
            extra_args: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

fn default_server_binary() -> String {
    "appium".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    4723
}

fn default_liveness_attempts() -> u32 {
    3
}

fn default_liveness_interval() -> u64 {
    2000
}

fn default_drivers() -> Vec<String> {
    vec!["uiautomator2".to_string(), "xcuitest".to_string()]
}

fn default_plugins() -> Vec<String> {
    ["gestures", "images", "ocr", "relaxed-caps"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Device discovery, boot and port settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `boot_timeout_secs` | 120 |
/// | `shutdown_timeout_secs` | 60 |
/// | `boot_poll_interval_ms` | 1000 |
/// | `list_timeout_secs` | 30 |
/// | `port_range_start` | 4724 |
/// | `port_range_end` | 4823 |
/// | `shutdown_after_run` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// How long a simulator may take to report `Booted`.
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,

    /// Timeout for `simctl shutdown`.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Delay between boot status polls.
    #[serde(default = "default_boot_poll_interval")]
    pub boot_poll_interval_ms: u64,

    /// Timeout for device listing commands.
    #[serde(default = "default_list_timeout")]
    pub list_timeout_secs: u64,

    /// First port handed out to devices (inclusive).
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last port handed out to devices (inclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Shut down simulators booted by devicegrid once their run is cleaned up.
    #[serde(default)]
    pub shutdown_after_run: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            boot_timeout_secs: default_boot_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            boot_poll_interval_ms: default_boot_poll_interval(),
            list_timeout_secs: default_list_timeout(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            shutdown_after_run: false,
        }
    }
}

impl DeviceConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.boot_poll_interval_ms)
    }
}

fn default_boot_timeout() -> u64 {
    120
}

fn default_shutdown_timeout() -> u64 {
    60
}

fn default_boot_poll_interval() -> u64 {
    1000
}

fn default_list_timeout() -> u64 {
    30
}

fn default_port_range_start() -> u16 {
    4724
}

fn default_port_range_end() -> u16 {
    4823
}

/// The suite run once per device.
///
/// The command is split with shell quoting rules, never run through a shell.
/// Placeholders:
/// - `{deviceId}`, `{platform}`, `{deviceName}`, `{osVersion}`, `{port}`,
///   `{serverUrl}` and any key of `parameters`
/// - `{data:<testCaseId>.<field>}` for cached test data
///
/// Every parameter is also exported as `DEVICEGRID_<KEY>` in upper snake case.
///
/// # Example
///
/// ```toml
/// [suite]
/// name = "login"
/// command = "mvn -q test -Dudid={deviceId} -Dappium.port={port} -Duser={data:LOGIN_001.username}"
/// skip_exit_code = 3
///
/// [suite.parameters]
/// appPath = "apps/Demo.apk"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Suite name, used in logs and as part of retry identities.
    pub name: String,

    /// Command to run per device.
    pub command: String,

    /// Suite-level parameters merged under the device parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Exit code that marks a run as skipped.
    #[serde(default = "default_skip_exit_code")]
    pub skip_exit_code: i32,

    /// Working directory for the suite command.
    pub working_dir: Option<PathBuf>,

    /// Directory for per-device suite logs. Output is shown on the terminal when unset.
    pub log_dir: Option<PathBuf>,
}

fn default_skip_exit_code() -> i32 {
    3
}

/// Test-data source backing the cached data store.
///
/// A `.csv` file is a table with a header row containing a `TestCaseId`
/// column. A `.toml` or JSON file is shaped as
/// `{ "<testCaseId>": { "<field>": "<value>" } }`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DataConfig {
    /// Path to the test-data file.
    pub path: Option<PathBuf>,
}
