//! Parsers for device listing command output.
//!
//! Two formats are understood:
//!
//! - `adb devices`: a header line followed by `serial<TAB>status` lines.
//! - `xcrun simctl list devices`: runtime headers such as `-- iOS 17.0 --`
//!   followed by `Name (UDID) (State)` lines.

use std::sync::LazyLock;

use regex::Regex;

/// One line of `adb devices` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbEntry {
    pub serial: String,
    pub status: String,
}

impl AdbEntry {
    /// `device` is the only status in which adb accepts commands.
    pub fn is_online(&self) -> bool {
        self.status == "device"
    }

    /// Emulators are listed as `emulator-<console port>`.
    pub fn is_emulator(&self) -> bool {
        self.serial.starts_with("emulator-")
    }
}

/// One simulator from `xcrun simctl list devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimctlEntry {
    pub name: String,
    pub udid: String,
    pub state: String,
    pub os_version: String,
}

impl SimctlEntry {
    pub fn is_booted(&self) -> bool {
        self.state == "Booted"
    }

    pub fn is_shutdown(&self) -> bool {
        self.state == "Shutdown"
    }
}

static RUNTIME_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^--\s*(?P<runtime>.+?)\s*--$").expect("valid regex"));

static SIMCTL_DEVICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<name>.+)\s+\((?P<id>[^()\s]+)\)\s+\((?P<state>[^()]+)\)\s*$")
        .expect("valid regex")
});

/// Parses `adb devices` output.
///
/// The `List of devices attached` header, blank lines and daemon chatter
/// (`* daemon started successfully`) are skipped.
pub fn parse_adb_devices(output: &str) -> Vec<AdbEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let serial = parts.next()?.trim();
            let status = parts.next()?.trim();
            if serial.is_empty() || status.is_empty() {
                return None;
            }
            Some(AdbEntry {
                serial: serial.to_string(),
                status: status.to_string(),
            })
        })
        .collect()
}

/// Parses `xcrun simctl list devices` output, keeping only iOS runtimes.
///
/// Devices under `watchOS`, `tvOS` or `Unavailable` runtime headers and
/// lines flagged `unavailable` are dropped.
pub fn parse_simctl_devices(output: &str) -> Vec<SimctlEntry> {
    let mut entries = Vec::new();
    let mut runtime: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("==") {
            continue;
        }

        if let Some(caps) = RUNTIME_HEADER.captures(trimmed) {
            runtime = caps["runtime"]
                .strip_prefix("iOS ")
                .map(|version| version.trim().to_string());
            continue;
        }

        let Some(os_version) = runtime.as_ref() else {
            continue;
        };
        if trimmed.contains("unavailable") {
            continue;
        }

        if let Some(caps) = SIMCTL_DEVICE.captures(trimmed) {
            entries.push(SimctlEntry {
                name: caps["name"].trim().to_string(),
                udid: caps["id"].to_string(),
                state: caps["state"].trim().to_string(),
                os_version: os_version.clone(),
            });
        }
    }

    entries
}
