//! devicegrid: parallel mobile UI test orchestration.
//!
//! This crate runs an automated UI test suite once per device across a pool
//! of Android and iOS devices, physical or virtual, in parallel.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Server**: Starts and stops the local automation server
//! - **Device**: Discovers devices, boots simulators, tracks device state
//! - **Ports**: Assigns each device its own automation port
//! - **Data**: Serves cached test data to concurrent runs
//! - **Coordinator**: Runs the suite on every device with bounded retries
//! - **Orchestrator**: Ties everything together for one suite run
//!
//! # Example
//!
//! ```no_run
//! use devicegrid::config::load_config;
//! use devicegrid::coordinator::SuiteDescriptor;
//! use devicegrid::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("devicegrid.toml"))?;
//!     let suite = SuiteDescriptor::from(&config.suite);
//!     let summary = Orchestrator::new(config).run_suite(&suite).await?;
//!     println!("{} of {} device runs passed", summary.passed, summary.total);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod data;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod report;
pub mod server;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use coordinator::{ParallelCoordinator, RetryPolicy, RunSummary, SuiteDescriptor};
pub use data::CachedDataStore;
pub use device::{DeviceRecord, DeviceRegistry, Platform};
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::Orchestrator;
pub use ports::PortAllocator;
pub use server::ServerLifecycleManager;
