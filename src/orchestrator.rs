//! Suite orchestration across the device pool.
//!
//! The [`Orchestrator`] is the explicitly constructed context that owns
//! every component of a run and drives the suite lifecycle end to end.
//!
//! # Architecture
//!
//! ```text
//!                        Orchestrator
//!   ┌──────────────┬───────────┴───────┬────────────────────┐
//!   ▼              ▼                   ▼                    ▼
//! ServerLifecycle  DeviceRegistry ◄── ParallelCoordinator ─► CachedDataStore
//!   Manager            │                │      │                  ▲
//!                      ▼                ▼      ▼                  │
//!                ProcessRunner   PortAllocator SuiteRunner ───────┘
//!                                             RetryPolicy
//! ```
//!
//! # Execution Flow
//!
//! 1. **Server**: start the automation server (unless `start_server = false`)
//! 2. **Initialize**: discover and boot devices, assign ports, size the pool
//! 3. **Dispatch**: one run per device, retried per the retry policy
//! 4. **Await**: wait for all runs up to the suite timeout
//! 5. **Teardown**: clean up every device and stop the server
//!
//! Teardown runs on every path, including failed initialization.
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
//!
//!     let orchestrator = Orchestrator::new(config);
//!     let summary = orchestrator.run_suite(&suite).await?;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::{
    CommandSuiteRunner, CoordinatorOptions, ParallelCoordinator, RetryPolicy, RunSummary,
    SuiteDescriptor, SuiteRunner,
};
use crate::data::{CachedDataStore, FileRowLoader, MemoryRowLoader, RowLoader};
use crate::device::{DeviceRecord, DeviceRegistry, Platform};
use crate::error::OrchestratorResult;
use crate::ports::PortAllocator;
use crate::process::{LocalProcessRunner, ProcessRunner};
use crate::server::{LivenessProbe, ServerLifecycleManager, TcpProbe};

/// Owns every component of a suite run.
pub struct Orchestrator {
    config: Config,
    server: ServerLifecycleManager,
    registry: Arc<DeviceRegistry>,
    ports: Arc<PortAllocator>,
    data: Arc<CachedDataStore>,
    retry: RetryPolicy,
    coordinator: ParallelCoordinator,
}

impl Orchestrator {
    /// Creates an orchestrator running local processes.
    ///
    /// Test data comes from `[data].path` when set.
    pub fn new(config: Config) -> Self {
        let loader: Arc<dyn RowLoader> = match &config.data.path {
            Some(path) => Arc::new(FileRowLoader::new(path)),
            None => Arc::new(MemoryRowLoader::default()),
        };
        Self::from_parts(
            config,
            Arc::new(LocalProcessRunner::new()),
            Arc::new(TcpProbe::default()),
            loader,
        )
    }

    /// Creates an orchestrator from explicit collaborators.
    ///
    /// Suites run through a [`CommandSuiteRunner`] on `process`.
    pub fn from_parts(
        config: Config,
        process: Arc<dyn ProcessRunner>,
        probe: Arc<dyn LivenessProbe>,
        loader: Arc<dyn RowLoader>,
    ) -> Self {
        let data = Arc::new(CachedDataStore::new(loader));
        let suite_runner: Arc<dyn SuiteRunner> =
            Arc::new(CommandSuiteRunner::new(process.clone()).with_data(data.clone()));

        let server = ServerLifecycleManager::new(config.server.clone(), process.clone(), probe);
        let registry = Arc::new(DeviceRegistry::new(process, config.devices.clone()));
        let ports = Arc::new(
            PortAllocator::new(config.devices.port_range_start, config.devices.port_range_end)
                .with_default_port(config.server.port),
        );
        let retry = RetryPolicy::new(config.orchestrator.retry_count);
        let coordinator = ParallelCoordinator::new(
            registry.clone(),
            ports.clone(),
            retry.clone(),
            suite_runner,
            coordinator_options(&config, server.url()),
        );

        Self {
            config,
            server,
            registry,
            ports,
            data,
            retry,
            coordinator,
        }
    }

    /// Runs `suite` on every available device and tears everything down.
    ///
    /// # Errors
    ///
    /// Fatal [`OrchestratorError`](crate::error::OrchestratorError)s: the
    /// server did not start, no device is usable, or dispatch failed.
    /// Failed runs are not errors; they are counted in the [`RunSummary`].
    pub async fn run_suite(&self, suite: &SuiteDescriptor) -> Result<RunSummary> {
        info!("Running suite {}", suite.name);

        let result = self.execute(suite).await;
        self.teardown().await;

        let summary = result?;
        info!(
            "Suite {} finished: {} passed, {} failed, {} skipped",
            suite.name, summary.passed, summary.failed, summary.skipped
        );
        Ok(summary)
    }

    async fn execute(&self, suite: &SuiteDescriptor) -> OrchestratorResult<RunSummary> {
        if self.config.orchestrator.start_server {
            self.server.start().await?;
        }

        self.coordinator.initialize().await?;
        self.coordinator.dispatch(suite)?;
        Ok(self
            .coordinator
            .await_completion(self.config.orchestrator.suite_timeout())
            .await)
    }

    async fn teardown(&self) {
        self.coordinator.cleanup_all().await;
        if self.config.orchestrator.start_server {
            self.server.stop().await;
        }
        let stats = self.retry.stats();
        if stats.total_retries > 0 {
            info!(
                "Retries used: {} ({} passed after retry)",
                stats.total_retries, stats.flaky
            );
        }
    }

    /// Discovers devices on every configured platform without claiming them.
    pub async fn list_devices(&self) -> Vec<(Platform, OrchestratorResult<Vec<DeviceRecord>>)> {
        let mut listings = Vec::new();
        for platform in &self.config.orchestrator.platforms {
            let result = self.registry.discover(*platform).await;
            if let Err(e) = &result {
                warn!("{}", e);
            }
            listings.push((*platform, result));
        }
        listings
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self) -> &ServerLifecycleManager {
        &self.server
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn data(&self) -> &CachedDataStore {
        &self.data
    }

    pub fn coordinator(&self) -> &ParallelCoordinator {
        &self.coordinator
    }
}

fn coordinator_options(config: &Config, server_url: String) -> CoordinatorOptions {
    CoordinatorOptions {
        platforms: config.orchestrator.platforms.clone(),
        max_devices: config.orchestrator.max_devices,
        server_url,
        shutdown_after_run: config.devices.shutdown_after_run,
    }
}
