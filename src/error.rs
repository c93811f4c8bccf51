//! Error taxonomy for device orchestration.
//!
//! Every variant carries a stable error code and an actionable suggestion so
//! that suite-level failures can be surfaced to the user as
//! `error[CODE]: message` followed by a hint on how to fix it.
//!
//! # Propagation
//!
//! | Error | Scope | Handling |
//! |-------|-------|----------|
//! | `ServerStartTimeout`, `ServerStartFailed` | Suite | Fatal, no run attempted |
//! | `NoDevicesAvailable` | Suite | Fatal, no pool created |
//! | `DeviceDiscoveryFailed`, `DeviceBootFailed` | Platform / device | Logged, device skipped |
//! | `NoDeviceAvailable`, `PortAllocationExhausted` | Device | Propagated to caller |
//! | `NoDataForKey` | Field | Logged, empty value returned |
//! | `DispatchFailed` | Suite | Propagated to caller |

use std::time::Duration;

use crate::device::Platform;

/// Result type for orchestration operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors raised by the orchestration subsystem.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The automation server did not accept connections in time.
    #[error("Automation server on {address}:{port} not reachable after {attempts} attempts")]
    ServerStartTimeout {
        address: String,
        port: u16,
        attempts: u32,
    },

    /// The automation server process could not be launched.
    #[error("Failed to launch automation server: {0}")]
    ServerStartFailed(String),

    /// The device listing command could not be invoked.
    #[error("Failed to list {platform} devices: {reason}")]
    DeviceDiscoveryFailed { platform: Platform, reason: String },

    /// A virtual device did not reach the ready state.
    #[error("Failed to boot device {device_id}: {reason}")]
    DeviceBootFailed { device_id: String, reason: String },

    /// No ready device exists for the requested platform.
    #[error("No {0} device available")]
    NoDeviceAvailable(Platform),

    /// Discovery across all configured platforms found nothing usable.
    #[error("No devices available for test execution")]
    NoDevicesAvailable,

    /// Every port in the reserved range is assigned.
    #[error("No free port in range {start}-{end} for device {device_id}")]
    PortAllocationExhausted {
        device_id: String,
        start: u16,
        end: u16,
    },

    /// A test-data field is missing after the row was loaded.
    #[error("No data found for test case {test_case} and key {key}")]
    NoDataForKey { test_case: String, key: String },

    /// Work could not be submitted to the worker pool.
    #[error("Failed to dispatch suite: {0}")]
    DispatchFailed(String),
}

impl OrchestratorError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServerStartTimeout { .. } => "SERVER_START_TIMEOUT",
            Self::ServerStartFailed(_) => "SERVER_START_FAILED",
            Self::DeviceDiscoveryFailed { .. } => "DEVICE_DISCOVERY_FAILED",
            Self::DeviceBootFailed { .. } => "DEVICE_BOOT_FAILED",
            Self::NoDeviceAvailable(_) => "NO_DEVICE_AVAILABLE",
            Self::NoDevicesAvailable => "NO_DEVICES_AVAILABLE",
            Self::PortAllocationExhausted { .. } => "PORT_ALLOCATION_EXHAUSTED",
            Self::NoDataForKey { .. } => "NO_DATA_FOR_KEY",
            Self::DispatchFailed(_) => "DISPATCH_FAILED",
        }
    }

    /// A hint telling the user what to check next.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::ServerStartTimeout { .. } => {
                "Check that the server port is free and the automation server is installed"
            }
            Self::ServerStartFailed(_) => {
                "Check that the server binary is on PATH or set [server].binary"
            }
            Self::DeviceDiscoveryFailed { platform, .. } => match platform {
                Platform::Android => "Check that ADB is installed and on PATH",
                Platform::Ios => "Check that Xcode and the iOS Simulator are installed",
            },
            Self::DeviceBootFailed { .. } => {
                "Check that the simulator exists and is not already booting elsewhere"
            }
            Self::NoDeviceAvailable(Platform::Android) => {
                "Check that devices are connected and ADB is working"
            }
            Self::NoDeviceAvailable(Platform::Ios) => {
                "Check that Xcode and the iOS Simulator are installed"
            }
            Self::NoDevicesAvailable => {
                "Connect physical devices or start emulators/simulators, then check device connections"
            }
            Self::PortAllocationExhausted { .. } => {
                "Widen [devices].port_range_start/port_range_end or lower max_devices"
            }
            Self::NoDataForKey { .. } => "Add the field to the test-data file",
            Self::DispatchFailed(_) => "Check test configuration and device availability",
        }
    }

    /// Whether the error must halt the suite before any run starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ServerStartTimeout { .. }
                | Self::ServerStartFailed(_)
                | Self::NoDevicesAvailable
                | Self::DispatchFailed(_)
        )
    }
}

/// Formats a liveness budget for log messages.
pub(crate) fn describe_budget(attempts: u32, interval: Duration) -> String {
    format!("{} attempts every {}ms", attempts, interval.as_millis())
}
