//! Device discovery and tracking.
//!
//! The [`DeviceRegistry`] lists physical and virtual devices per platform,
//! boots simulators on demand and tracks every device's lifecycle state.
//!
//! # Device Lifecycle
//!
//! ```text
//!  Discovered ──boot──► Booting ──► Ready ──dispatch──► InUse ──cleanup──► Cleaning ──► (removed)
//!       │                  │
//!       └──────────────────┴──boot failure──► Unavailable
//! ```
//!
//! # Listing Commands
//!
//! | Platform | Command | Format |
//! |----------|---------|--------|
//! | Android | `adb devices` | `serial<TAB>status` |
//! | iOS | `xcrun simctl list devices` | `Name (UDID) (State)` |

pub mod parse;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::process::{Command, ProcessRunner};

pub use parse::{AdbEntry, SimctlEntry, parse_adb_devices, parse_simctl_devices};

const UNKNOWN_VERSION: &str = "unknown";

/// Mobile platform of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    /// Lowercase identifier used in configuration and parameters.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Android => write!(f, "Android"),
            Platform::Ios => write!(f, "iOS"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(format!("Unknown platform: {}. Use: android, ios", other)),
        }
    }
}

/// Whether a device is real hardware or an emulator/simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Physical,
    Virtual,
}

/// Lifecycle state of a tracked device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    /// Listed but not ready for a session (shut-down simulator).
    Discovered,
    /// A boot command has been issued.
    Booting,
    /// Accepts automation sessions.
    Ready,
    /// A run is executing on the device.
    InUse,
    /// Resources for the device are being released.
    Cleaning,
    /// Failed to boot or otherwise unusable.
    Unavailable,
}

impl DeviceState {
    /// States owned by the coordinator, which discovery must not overwrite.
    fn is_claimed(&self) -> bool {
        matches!(
            self,
            DeviceState::Booting | DeviceState::InUse | DeviceState::Cleaning
        )
    }
}

/// Tracked identity and state of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// Stable unique id: adb serial or simulator UDID.
    pub device_id: String,
    pub platform: Platform,
    pub kind: DeviceKind,
    pub display_name: String,
    pub os_version: String,
    pub state: DeviceState,
}

impl DeviceRecord {
    fn from_adb(entry: &AdbEntry, display_name: String, os_version: String) -> Self {
        Self {
            device_id: entry.serial.clone(),
            platform: Platform::Android,
            kind: if entry.is_emulator() {
                DeviceKind::Virtual
            } else {
                DeviceKind::Physical
            },
            display_name,
            os_version,
            state: DeviceState::Ready,
        }
    }

    fn from_simctl(entry: &SimctlEntry) -> Option<Self> {
        let state = if entry.is_booted() {
            DeviceState::Ready
        } else if entry.is_shutdown() {
            DeviceState::Discovered
        } else {
            return None;
        };

        Some(Self {
            device_id: entry.udid.clone(),
            platform: Platform::Ios,
            kind: DeviceKind::Virtual,
            display_name: entry.name.clone(),
            os_version: entry.os_version.clone(),
            state,
        })
    }

    /// Whether [`DeviceRegistry::boot_if_needed`] would issue a boot.
    pub fn needs_boot(&self) -> bool {
        self.kind == DeviceKind::Virtual
            && self.platform == Platform::Ios
            && self.state == DeviceState::Discovered
    }
}

/// Discovers devices and tracks their state.
///
/// Shared between the coordinator and its workers; all state sits behind a
/// mutex that is never held across an `.await`.
pub struct DeviceRegistry {
    runner: Arc<dyn ProcessRunner>,
    config: DeviceConfig,
    devices: Mutex<Vec<DeviceRecord>>,
    booted_here: Mutex<HashSet<String>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new(runner: Arc<dyn ProcessRunner>, config: DeviceConfig) -> Self {
        Self {
            runner,
            config,
            devices: Mutex::new(Vec::new()),
            booted_here: Mutex::new(HashSet::new()),
        }
    }

    /// Lists devices for `platform` and merges them into the registry.
    ///
    /// Returns the records in `Discovered` or `Ready` state. Devices of the
    /// platform that are no longer listed are forgotten unless a run owns
    /// them.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::DeviceDiscoveryFailed`] if the listing command
    /// cannot be invoked or exits non-zero.
    pub async fn discover(&self, platform: Platform) -> OrchestratorResult<Vec<DeviceRecord>> {
        let listed = match platform {
            Platform::Android => self.list_android().await?,
            Platform::Ios => self.list_ios().await?,
        };

        let mut devices = self.lock_devices();
        devices.retain(|d| {
            d.platform != platform
                || d.state.is_claimed()
                || listed.iter().any(|l| l.device_id == d.device_id)
        });

        for record in &listed {
            match devices.iter_mut().find(|d| d.device_id == record.device_id) {
                Some(existing) if existing.state.is_claimed() => {}
                Some(existing) => *existing = record.clone(),
                None => devices.push(record.clone()),
            }
        }

        let found: Vec<DeviceRecord> = devices
            .iter()
            .filter(|d| d.platform == platform)
            .filter(|d| matches!(d.state, DeviceState::Discovered | DeviceState::Ready))
            .cloned()
            .collect();

        info!("Found {} available {} devices", found.len(), platform);
        Ok(found)
    }

    async fn list_android(&self) -> OrchestratorResult<Vec<DeviceRecord>> {
        let stdout = self
            .run_listing(Platform::Android, Command::new("adb").arg("devices"))
            .await?;

        let mut records = Vec::new();
        for entry in parse_adb_devices(&stdout) {
            if !entry.is_online() {
                debug!("Skipping adb device {} ({})", entry.serial, entry.status);
                continue;
            }
            let os_version = self
                .getprop(&entry.serial, "ro.build.version.release")
                .await
                .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
            let display_name = self
                .getprop(&entry.serial, "ro.product.model")
                .await
                .unwrap_or_else(|| entry.serial.clone());
            records.push(DeviceRecord::from_adb(&entry, display_name, os_version));
        }
        Ok(records)
    }

    async fn list_ios(&self) -> OrchestratorResult<Vec<DeviceRecord>> {
        let stdout = self.run_listing(Platform::Ios, simctl_list()).await?;
        Ok(parse_simctl_devices(&stdout)
            .iter()
            .filter_map(DeviceRecord::from_simctl)
            .collect())
    }

    async fn run_listing(&self, platform: Platform, cmd: Command) -> OrchestratorResult<String> {
        let cmd = cmd.timeout(self.config.list_timeout_secs);
        let result = self.runner.output(&cmd).await.map_err(|e| {
            OrchestratorError::DeviceDiscoveryFailed {
                platform,
                reason: e.to_string(),
            }
        })?;

        if !result.success() {
            return Err(OrchestratorError::DeviceDiscoveryFailed {
                platform,
                reason: format!(
                    "`{}` exited with {}: {}",
                    cmd.to_shell_string(),
                    result.exit_code,
                    result.stderr.trim()
                ),
            });
        }
        Ok(result.stdout)
    }

    /// Best-effort `getprop` lookup; `None` when the property is unreadable.
    async fn getprop(&self, serial: &str, property: &str) -> Option<String> {
        let cmd = Command::new("adb")
            .args(["-s", serial, "shell", "getprop", property])
            .timeout(self.config.list_timeout_secs);
        match self.runner.output(&cmd).await {
            Ok(result) if result.success() && !result.stdout.trim().is_empty() => {
                Some(result.stdout.trim().to_string())
            }
            Ok(_) => None,
            Err(e) => {
                debug!("getprop {} on {} failed: {}", property, serial, e);
                None
            }
        }
    }

    /// Boots a shut-down simulator and waits until it reports `Booted`.
    ///
    /// Records that need no boot (physical devices, running emulators,
    /// already booted simulators) are returned unchanged.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::DeviceBootFailed`] if the boot command cannot be
    /// run or the device is not booted within `boot_timeout_secs`. The
    /// device is marked `Unavailable`.
    pub async fn boot_if_needed(
        &self,
        device: &DeviceRecord,
    ) -> OrchestratorResult<DeviceRecord> {
        if !device.needs_boot() {
            return Ok(self.get(&device.device_id).unwrap_or_else(|| device.clone()));
        }

        info!("Booting simulator {} ({})", device.display_name, device.device_id);
        self.upsert_state(device, DeviceState::Booting);

        match self.boot_and_wait(&device.device_id).await {
            Ok(()) => {
                self.booted_here
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(device.device_id.clone());
                self.set_state(&device.device_id, DeviceState::Ready);
                info!("Simulator {} booted", device.device_id);
                Ok(self.get(&device.device_id).unwrap_or_else(|| DeviceRecord {
                    state: DeviceState::Ready,
                    ..device.clone()
                }))
            }
            Err(reason) => {
                warn!("Failed to boot simulator {}: {}", device.device_id, reason);
                self.set_state(&device.device_id, DeviceState::Unavailable);
                Err(OrchestratorError::DeviceBootFailed {
                    device_id: device.device_id.clone(),
                    reason,
                })
            }
        }
    }

    /// Boot command and readiness polling share one `boot_timeout_secs` budget.
    async fn boot_and_wait(&self, device_id: &str) -> Result<(), String> {
        tokio::time::timeout(self.config.boot_timeout(), self.boot_then_poll(device_id))
            .await
            .map_err(|_| format!("not booted after {}s", self.config.boot_timeout_secs))?
    }

    async fn boot_then_poll(&self, device_id: &str) -> Result<(), String> {
        let boot = Command::new("xcrun")
            .args(["simctl", "boot", device_id])
            .timeout(self.config.boot_timeout_secs);
        let result = self.runner.output(&boot).await.map_err(|e| e.to_string())?;
        if !result.success() {
            // simctl also exits non-zero for a device that is already booting
            debug!(
                "simctl boot {} exited with {}: {}",
                device_id,
                result.exit_code,
                result.stderr.trim()
            );
        }

        loop {
            match self.runner.output(&simctl_list()).await {
                Ok(listing) if listing.success() => {
                    let booted = parse_simctl_devices(&listing.stdout)
                        .iter()
                        .any(|e| e.udid == device_id && e.is_booted());
                    if booted {
                        return Ok(());
                    }
                }
                Ok(listing) => debug!("simctl list exited with {}", listing.exit_code),
                Err(e) => debug!("simctl list failed while booting: {}", e),
            }
            tokio::time::sleep(self.config.boot_poll_interval()).await;
        }
    }

    /// Returns the first ready device of a platform, booting a simulator if needed.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::DeviceDiscoveryFailed`] if listing fails
    /// - [`OrchestratorError::NoDeviceAvailable`] if nothing is ready or bootable
    pub async fn pick_first_available(
        &self,
        platform: Platform,
    ) -> OrchestratorResult<DeviceRecord> {
        let devices = self.discover(platform).await?;

        if let Some(ready) = devices.iter().find(|d| d.state == DeviceState::Ready) {
            return Ok(ready.clone());
        }

        for candidate in devices.iter().filter(|d| d.needs_boot()) {
            match self.boot_if_needed(candidate).await {
                Ok(device) => return Ok(device),
                Err(e) => warn!("{}", e),
            }
        }

        Err(OrchestratorError::NoDeviceAvailable(platform))
    }

    /// Shuts down a simulator. Failures are logged, never returned.
    pub async fn shutdown(&self, device_id: &str) {
        let Some(device) = self.get(device_id) else {
            return;
        };
        if device.kind != DeviceKind::Virtual || device.platform != Platform::Ios {
            return;
        }

        let cmd = Command::new("xcrun")
            .args(["simctl", "shutdown", device_id])
            .timeout(self.config.shutdown_timeout_secs);
        match self.runner.output(&cmd).await {
            Ok(result) if result.success() => {
                info!("Simulator {} shut down", device_id);
                self.booted_here
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(device_id);
                self.set_state(device_id, DeviceState::Discovered);
            }
            Ok(result) => warn!(
                "Failed to shut down simulator {}: exit {}: {}",
                device_id,
                result.exit_code,
                result.stderr.trim()
            ),
            Err(e) => warn!("Failed to shut down simulator {}: {}", device_id, e),
        }
    }

    /// Whether this registry booted the simulator itself.
    pub fn was_booted_here(&self, device_id: &str) -> bool {
        self.booted_here
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(device_id)
    }

    /// Looks up a device by id.
    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.lock_devices()
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned()
    }

    /// Snapshot of every tracked device, in discovery order.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.lock_devices().clone()
    }

    /// Snapshot of devices in the `Ready` state.
    pub fn ready_devices(&self) -> Vec<DeviceRecord> {
        self.lock_devices()
            .iter()
            .filter(|d| d.state == DeviceState::Ready)
            .cloned()
            .collect()
    }

    /// Updates a tracked device's state. Returns `false` for unknown ids.
    pub fn set_state(&self, device_id: &str, state: DeviceState) -> bool {
        match self
            .lock_devices()
            .iter_mut()
            .find(|d| d.device_id == device_id)
        {
            Some(device) => {
                debug!("Device {}: {:?} -> {:?}", device_id, device.state, state);
                device.state = state;
                true
            }
            None => false,
        }
    }

    /// Forgets a device. Returns the removed record, if any.
    pub fn remove(&self, device_id: &str) -> Option<DeviceRecord> {
        let mut devices = self.lock_devices();
        let index = devices.iter().position(|d| d.device_id == device_id)?;
        Some(devices.remove(index))
    }

    fn upsert_state(&self, device: &DeviceRecord, state: DeviceState) {
        let mut devices = self.lock_devices();
        match devices.iter_mut().find(|d| d.device_id == device.device_id) {
            Some(existing) => existing.state = state,
            None => devices.push(DeviceRecord {
                state,
                ..device.clone()
            }),
        }
    }

    fn lock_devices(&self) -> std::sync::MutexGuard<'_, Vec<DeviceRecord>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn simctl_list() -> Command {
    Command::new("xcrun").args(["simctl", "list", "devices"])
}
