//! Parallel execution of a suite across a device pool.
//!
//! The [`ParallelCoordinator`] turns the devices found by the
//! [`DeviceRegistry`] into a bounded worker pool and runs the suite once per
//! device, concurrently.
//!
//! # Lifecycle
//!
//! ```text
//!  initialize()          discover ─► boot ─► assign ports ─► size pool
//!       │
//!  dispatch(suite)       one task per Ready device
//!       │                  ├─ params ─► InUse ─► Run Ticket (Running)
//!       │                  ├─ SuiteRunner::run ◄──┐
//!       │                  │      └─ failed ─► RetryPolicy::should_retry
//!       │                  └─ terminal status ─► release worker slot
//!       │
//!  await_completion(t)   wait all; on timeout cancel + mark abandoned
//!       │
//!  cleanup_all()         cancel ─► release ports ─► forget devices ─► close pool
//! ```
//!
//! Ports are assigned before any run starts and released only in cleanup,
//! after the run's terminal status is recorded.

pub mod retry;
pub mod runner;
pub mod ticket;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceRecord, DeviceRegistry, DeviceState, Platform};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::ports::PortAllocator;

pub use retry::{RetryPolicy, RetryStats};
pub use runner::{
    CommandSuiteRunner, RunOutcome, RunParameters, SuiteDescriptor, SuiteRunner,
};
pub use ticket::{ABANDONED, RunStatus, RunSummary, RunTicket};

/// Settings for a [`ParallelCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Platforms to discover devices for, in order.
    pub platforms: Vec<Platform>,
    /// Upper bound on pool size.
    pub max_devices: Option<usize>,
    /// Automation server URL handed to every run.
    pub server_url: String,
    /// Shut down simulators booted during `initialize` on cleanup.
    pub shutdown_after_run: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            platforms: vec![Platform::Android, Platform::Ios],
            max_devices: None,
            server_url: "http://127.0.0.1:4723".to_string(),
            shutdown_after_run: false,
        }
    }
}

type TicketMap = Arc<Mutex<BTreeMap<String, RunTicket>>>;

/// The bounded worker pool created by `initialize`.
struct Pool {
    slots: Arc<Semaphore>,
    size: usize,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    devices: Vec<String>,
}

/// Runs a suite on every available device in parallel.
pub struct ParallelCoordinator {
    registry: Arc<DeviceRegistry>,
    ports: Arc<PortAllocator>,
    retry: RetryPolicy,
    runner: Arc<dyn SuiteRunner>,
    options: CoordinatorOptions,
    tickets: TicketMap,
    pool: Mutex<Option<Pool>>,
    dispatched_at: Mutex<Option<Instant>>,
}

impl ParallelCoordinator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        ports: Arc<PortAllocator>,
        retry: RetryPolicy,
        runner: Arc<dyn SuiteRunner>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            registry,
            ports,
            retry,
            runner,
            options,
            tickets: Arc::new(Mutex::new(BTreeMap::new())),
            pool: Mutex::new(None),
            dispatched_at: Mutex::new(None),
        }
    }

    /// Discovers devices, boots simulators, assigns ports and sizes the pool.
    ///
    /// Discovery failures for one platform and boot failures for one device
    /// are logged and skipped. Returns the pool size.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NoDevicesAvailable`] if no device is usable. No
    /// pool exists afterwards.
    pub async fn initialize(&self) -> OrchestratorResult<usize> {
        if let Some(size) = self.lock_pool().as_ref().map(|p| p.size) {
            warn!("Worker pool already initialized with {} slots", size);
            return Ok(size);
        }

        let limit = self.options.max_devices.unwrap_or(usize::MAX);
        let mut usable: Vec<DeviceRecord> = Vec::new();

        'platforms: for platform in &self.options.platforms {
            let discovered = match self.registry.discover(*platform).await {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("{} ({})", e, e.suggestion());
                    continue;
                }
            };

            for device in discovered {
                if usable.len() >= limit {
                    break 'platforms;
                }
                match self.registry.boot_if_needed(&device).await {
                    Ok(device) if device.state == DeviceState::Ready => usable.push(device),
                    Ok(device) => debug!(
                        "Skipping {} in state {:?}",
                        device.device_id, device.state
                    ),
                    Err(e) => warn!("{}", e),
                }
            }
        }

        let mut devices = Vec::with_capacity(usable.len());
        for device in &usable {
            match self.ports.assign(&device.device_id) {
                Ok(port) => {
                    info!(
                        "Device {} ({} {}) assigned port {}",
                        device.device_id, device.platform, device.display_name, port
                    );
                    devices.push(device.device_id.clone());
                }
                Err(e) => warn!("{}", e),
            }
        }

        if devices.is_empty() {
            error!("{}", OrchestratorError::NoDevicesAvailable);
            return Err(OrchestratorError::NoDevicesAvailable);
        }

        let size = devices.len();
        *self.lock_pool() = Some(Pool {
            slots: Arc::new(Semaphore::new(size)),
            size,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            devices,
        });
        info!("Initialized worker pool with {} slots", size);
        Ok(size)
    }

    /// Starts one run of `suite` on every Ready device of the pool.
    ///
    /// Returns the number of runs submitted.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::DispatchFailed`] before `initialize` or after
    /// `cleanup_all`.
    pub fn dispatch(&self, suite: &SuiteDescriptor) -> OrchestratorResult<usize> {
        let mut guard = self.lock_pool();
        let Some(pool) = guard.as_mut() else {
            return Err(OrchestratorError::DispatchFailed(
                "worker pool is not initialized".to_string(),
            ));
        };
        if pool.slots.is_closed() {
            return Err(OrchestratorError::DispatchFailed(
                "worker pool is shut down".to_string(),
            ));
        }

        self.dispatched_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(Instant::now);

        let mut submitted = 0;
        for device_id in &pool.devices {
            let Some(device) = self.registry.get(device_id) else {
                continue;
            };
            if device.state != DeviceState::Ready {
                debug!("Device {} is {:?}, not dispatching", device_id, device.state);
                continue;
            }

            let port = self.ports.port_for(device_id);
            let params = self.build_parameters(suite, &device, port);

            self.registry.set_state(device_id, DeviceState::InUse);
            self.lock_tickets().insert(
                device_id.clone(),
                RunTicket::start(device_id, device.platform, &device.display_name, port),
            );

            let worker = Worker {
                device_id: device_id.clone(),
                identity: suite.identity(device_id),
                suite: suite.clone(),
                params,
                registry: self.registry.clone(),
                retry: self.retry.clone(),
                runner: self.runner.clone(),
                tickets: self.tickets.clone(),
                cancel: pool.cancel.child_token(),
            };
            let slots = pool.slots.clone();
            pool.tasks.spawn(async move {
                let Ok(_slot) = slots.acquire_owned().await else {
                    worker.finish(RunStatus::Failed, Some("worker pool closed".to_string()));
                    return;
                };
                worker.run().await;
            });
            submitted += 1;
        }

        info!("Dispatched suite {} to {} devices", suite.name, submitted);
        Ok(submitted)
    }

    fn build_parameters(
        &self,
        suite: &SuiteDescriptor,
        device: &DeviceRecord,
        port: u16,
    ) -> RunParameters {
        let mut params: RunParameters = suite
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.insert("deviceId", device.device_id.as_str());
        params.insert("platform", device.platform.as_str());
        params.insert("deviceName", device.display_name.as_str());
        params.insert("osVersion", device.os_version.as_str());
        params.insert("port", port.to_string());
        params.insert("serverUrl", self.options.server_url.as_str());
        params
    }

    /// Waits for every dispatched run, up to `timeout`.
    ///
    /// Runs still going when the timeout elapses are cancelled, aborted and
    /// recorded as failed with the message `abandoned`.
    pub async fn await_completion(&self, timeout: Duration) -> RunSummary {
        let taken = self
            .lock_pool()
            .as_mut()
            .map(|p| (std::mem::take(&mut p.tasks), p.cancel.clone()));

        if let Some((mut tasks, cancel)) = taken {
            let drained = tokio::time::timeout(timeout, async {
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!("Worker panicked: {}", e);
                    }
                }
            })
            .await;

            if drained.is_err() {
                let abandoned = self.abandon_running(ABANDONED);
                warn!(
                    "Suite timeout of {:?} elapsed, abandoning {} runs",
                    timeout, abandoned
                );
                cancel.cancel();
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}

                if let Some(pool) = self.lock_pool().as_mut() {
                    pool.cancel = CancellationToken::new();
                }
            }

            // A run whose task died without recording a status.
            self.abandon_running("run ended without a result");
        }

        let duration = self
            .dispatched_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        RunSummary::from_tickets(self.tickets(), duration)
    }

    fn abandon_running(&self, message: &str) -> usize {
        let mut tickets = self.lock_tickets();
        let mut count = 0;
        for ticket in tickets.values_mut() {
            if ticket.finish(RunStatus::Failed, Some(message.to_string())) {
                count += 1;
            }
        }
        count
    }

    /// Releases everything held for one device. Unknown devices are ignored.
    pub async fn cleanup(&self, device_id: &str) {
        if let Some(ticket) = self.lock_tickets().remove(device_id)
            && !ticket.status.is_terminal()
        {
            warn!("Cleaning up device {} while its run is still going", device_id);
        }

        if self.registry.set_state(device_id, DeviceState::Cleaning)
            && self.options.shutdown_after_run
            && self.registry.was_booted_here(device_id)
        {
            self.registry.shutdown(device_id).await;
        }

        self.ports.release(device_id);
        self.registry.remove(device_id);
        if let Some(pool) = self.lock_pool().as_mut() {
            pool.devices.retain(|d| d != device_id);
        }
        debug!("Cleaned up device {}", device_id);
    }

    /// Cancels outstanding work, cleans up every device and closes the pool.
    ///
    /// Safe to call repeatedly and without a pool.
    pub async fn cleanup_all(&self) {
        let pool = self.lock_pool().take();

        let mut device_ids: Vec<String> = self.lock_tickets().keys().cloned().collect();
        if let Some(mut pool) = pool {
            pool.cancel.cancel();
            pool.slots.close();
            pool.tasks.abort_all();
            while pool.tasks.join_next().await.is_some() {}
            self.abandon_running(ABANDONED);

            for device_id in pool.devices {
                if !device_ids.contains(&device_id) {
                    device_ids.push(device_id);
                }
            }
        }

        futures::future::join_all(device_ids.iter().map(|id| self.cleanup(id))).await;

        for device_id in self.ports.assignments().into_keys() {
            self.ports.release(&device_id);
        }
        info!("Worker pool shut down");
    }

    /// Snapshot of all run tickets, ordered by device id.
    pub fn tickets(&self) -> Vec<RunTicket> {
        self.lock_tickets().values().cloned().collect()
    }

    pub fn ticket(&self, device_id: &str) -> Option<RunTicket> {
        self.lock_tickets().get(device_id).cloned()
    }

    /// Number of worker slots, 0 without a pool.
    pub fn pool_size(&self) -> usize {
        self.lock_pool().as_ref().map(|p| p.size).unwrap_or(0)
    }

    pub fn is_pool_active(&self) -> bool {
        self.lock_pool()
            .as_ref()
            .is_some_and(|p| !p.slots.is_closed())
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, Option<Pool>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tickets(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, RunTicket>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One device's unit of work.
struct Worker {
    device_id: String,
    identity: String,
    suite: SuiteDescriptor,
    params: RunParameters,
    registry: Arc<DeviceRegistry>,
    retry: RetryPolicy,
    runner: Arc<dyn SuiteRunner>,
    tickets: TicketMap,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        info!("Running suite {} on {}", self.suite.name, self.device_id);

        let (status, message) = loop {
            self.bump_attempts();

            let outcome = self
                .runner
                .run(&self.suite, &self.params, self.cancel.clone())
                .await;
            if self.cancel.is_cancelled() {
                break (RunStatus::Failed, Some(ABANDONED.to_string()));
            }

            let reason = match outcome {
                Ok(RunOutcome::Passed) => {
                    self.retry.record_pass(&self.identity);
                    break (RunStatus::Passed, None);
                }
                Ok(RunOutcome::Skipped) => break (RunStatus::Skipped, None),
                Ok(RunOutcome::Failed(reason)) => reason,
                Err(e) => format!("{:#}", e),
            };

            if self.retry.should_retry(&self.identity) {
                warn!(
                    "Suite {} failed on {} ({}), retry {}/{}",
                    self.suite.name,
                    self.device_id,
                    reason,
                    self.retry.attempts(&self.identity),
                    self.retry.max_attempts()
                );
                continue;
            }
            break (RunStatus::Failed, Some(reason));
        };

        match status {
            RunStatus::Failed => warn!(
                "Suite {} failed on {}: {}",
                self.suite.name,
                self.device_id,
                message.as_deref().unwrap_or("")
            ),
            _ => info!("Suite {} on {}: {:?}", self.suite.name, self.device_id, status),
        }
        self.finish(status, message);
    }

    fn bump_attempts(&self) {
        if let Some(ticket) = self
            .tickets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&self.device_id)
        {
            ticket.attempts += 1;
        }
    }

    fn finish(&self, status: RunStatus, message: Option<String>) {
        if let Some(ticket) = self
            .tickets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&self.device_id)
        {
            ticket.finish(status, message);
        }
        if self.registry.get(&self.device_id).map(|d| d.state) == Some(DeviceState::InUse) {
            self.registry.set_state(&self.device_id, DeviceState::Ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::DeviceConfig;
    use crate::process::testing::ScriptedRunner;

    const TWO_SIMS: &str = "== Devices ==\n-- iOS 17.0 --\n    iPhone 15 (sim-A) (Booted)\n    iPhone 15 Pro (sim-B) (Booted)\n";

    /// Suite runner returning scripted outcomes per device.
    #[derive(Default)]
    struct FakeSuite {
        outcomes: Mutex<HashMap<String, Vec<RunOutcome>>>,
        seen: Mutex<Vec<RunParameters>>,
        calls: AtomicUsize,
        hang: bool,
    }

    impl FakeSuite {
        fn hanging() -> Self {
            Self {
                hang: true,
                ..Default::default()
            }
        }

        fn script(self, device: &str, outcomes: Vec<RunOutcome>) -> Self {
            self.outcomes
                .lock()
                .unwrap()
                .insert(device.to_string(), outcomes);
            self
        }
    }

    #[async_trait]
    impl SuiteRunner for FakeSuite {
        async fn run(
            &self,
            _suite: &SuiteDescriptor,
            params: &RunParameters,
            cancel: CancellationToken,
        ) -> anyhow::Result<RunOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(params.clone());
            if self.hang {
                cancel.cancelled().await;
                return Ok(RunOutcome::Failed("cancelled".to_string()));
            }
            let device = params.get("deviceId").unwrap_or_default().to_string();
            let mut outcomes = self.outcomes.lock().unwrap();
            match outcomes.get_mut(&device) {
                Some(queue) if queue.len() > 1 => Ok(queue.remove(0)),
                Some(queue) if !queue.is_empty() => Ok(queue[0].clone()),
                _ => Ok(RunOutcome::Passed),
            }
        }
    }

    fn setup(
        process: Arc<ScriptedRunner>,
        suite: Arc<FakeSuite>,
        retries: u32,
        options: CoordinatorOptions,
    ) -> (ParallelCoordinator, Arc<DeviceRegistry>, Arc<PortAllocator>) {
        let registry = Arc::new(DeviceRegistry::new(process, DeviceConfig::default()));
        let ports = Arc::new(PortAllocator::new(4724, 4823));
        let coordinator = ParallelCoordinator::new(
            registry.clone(),
            ports.clone(),
            RetryPolicy::new(retries),
            suite,
            options,
        );
        (coordinator, registry, ports)
    }

    fn ios_only() -> CoordinatorOptions {
        CoordinatorOptions {
            platforms: vec![Platform::Ios],
            ..Default::default()
        }
    }

    fn two_simulators() -> Arc<ScriptedRunner> {
        let process = Arc::new(ScriptedRunner::new());
        process.on("xcrun simctl list devices", TWO_SIMS);
        process
    }

    #[tokio::test]
    async fn test_two_simulators_run_in_parallel() {
        let suite = Arc::new(FakeSuite::default());
        let (coordinator, _registry, ports) =
            setup(two_simulators(), suite.clone(), 3, ios_only());

        assert_eq!(coordinator.initialize().await.unwrap(), 2);
        assert_eq!(coordinator.pool_size(), 2);
        assert!(coordinator.is_pool_active());

        let login = SuiteDescriptor::new("login", "true");
        assert_eq!(coordinator.dispatch(&login).unwrap(), 2);
        let summary = coordinator.await_completion(Duration::from_secs(5)).await;

        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.exit_code(), 0);

        let tickets = coordinator.tickets();
        assert_eq!(tickets.len(), 2);
        assert_ne!(tickets[0].port, tickets[1].port);
        assert!(tickets.iter().all(|t| t.status == RunStatus::Passed));
        assert_eq!(ports.len(), 2);

        coordinator.cleanup_all().await;
        assert!(ports.is_empty());
        assert!(!coordinator.is_pool_active());
        assert_eq!(coordinator.pool_size(), 0);
        assert!(coordinator.tickets().is_empty());
    }

    #[tokio::test]
    async fn test_parameter_bag() {
        let suite = Arc::new(FakeSuite::default());
        let options = CoordinatorOptions {
            max_devices: Some(1),
            ..ios_only()
        };
        let (coordinator, _registry, _ports) = setup(two_simulators(), suite.clone(), 0, options);

        assert_eq!(coordinator.initialize().await.unwrap(), 1);
        let mut login = SuiteDescriptor::new("login", "true");
        login.parameters.insert("appPath".to_string(), "Demo.app".to_string());
        login.parameters.insert("deviceId".to_string(), "overridden".to_string());
        coordinator.dispatch(&login).unwrap();
        coordinator.await_completion(Duration::from_secs(5)).await;

        let seen = suite.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let params = &seen[0];
        assert_eq!(params.get("deviceId"), Some("sim-A"));
        assert_eq!(params.get("platform"), Some("ios"));
        assert_eq!(params.get("deviceName"), Some("iPhone 15"));
        assert_eq!(params.get("osVersion"), Some("17.0"));
        assert_eq!(params.get("port"), Some("4724"));
        assert_eq!(params.get("serverUrl"), Some("http://127.0.0.1:4723"));
        assert_eq!(params.get("appPath"), Some("Demo.app"));
    }

    #[tokio::test]
    async fn test_no_devices_leaves_no_pool() {
        let process = Arc::new(ScriptedRunner::new());
        process.on("adb devices", "List of devices attached\n\n");
        process.on("xcrun simctl list devices", "== Devices ==\n");
        let (coordinator, _registry, ports) =
            setup(process, Arc::new(FakeSuite::default()), 3, CoordinatorOptions::default());

        let err = coordinator.initialize().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoDevicesAvailable));
        assert!(!coordinator.is_pool_active());
        assert_eq!(coordinator.pool_size(), 0);
        assert!(ports.is_empty());

        let err = coordinator
            .dispatch(&SuiteDescriptor::new("login", "true"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DispatchFailed(_)));
    }

    #[tokio::test]
    async fn test_platform_discovery_failure_is_skipped() {
        let process = two_simulators();
        process.on_missing("adb devices");
        let (coordinator, _registry, _ports) =
            setup(process, Arc::new(FakeSuite::default()), 3, CoordinatorOptions::default());

        assert_eq!(coordinator.initialize().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_is_retried_until_pass() {
        let suite = Arc::new(FakeSuite::default().script(
            "sim-A",
            vec![
                RunOutcome::Failed("exit code 1".to_string()),
                RunOutcome::Failed("exit code 1".to_string()),
                RunOutcome::Passed,
            ],
        ));
        let (coordinator, _registry, _ports) = setup(two_simulators(), suite, 3, ios_only());

        coordinator.initialize().await.unwrap();
        coordinator
            .dispatch(&SuiteDescriptor::new("login", "true"))
            .unwrap();
        let summary = coordinator.await_completion(Duration::from_secs(5)).await;

        let ticket = coordinator.ticket("sim-A").unwrap();
        assert_eq!(ticket.status, RunStatus::Passed);
        assert_eq!(ticket.attempts, 3);
        assert_eq!(summary.flaky, 1);
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.exit_code(), 2);
        assert_eq!(coordinator.retry_policy().attempts("login@sim-A"), 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let suite = Arc::new(FakeSuite::default().script(
            "sim-B",
            vec![RunOutcome::Failed("exit code 1".to_string())],
        ));
        let (coordinator, _registry, _ports) = setup(two_simulators(), suite, 2, ios_only());

        coordinator.initialize().await.unwrap();
        coordinator
            .dispatch(&SuiteDescriptor::new("login", "true"))
            .unwrap();
        let summary = coordinator.await_completion(Duration::from_secs(5)).await;

        let ticket = coordinator.ticket("sim-B").unwrap();
        assert_eq!(ticket.status, RunStatus::Failed);
        assert_eq!(ticket.attempts, 3);
        assert_eq!(ticket.message.as_deref(), Some("exit code 1"));
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.success());
    }

    #[tokio::test]
    async fn test_skipped_run_is_not_retried() {
        let suite = Arc::new(FakeSuite::default().script("sim-A", vec![RunOutcome::Skipped]));
        let (coordinator, _registry, _ports) =
            setup(two_simulators(), suite.clone(), 3, ios_only());

        coordinator.initialize().await.unwrap();
        coordinator
            .dispatch(&SuiteDescriptor::new("login", "true"))
            .unwrap();
        let summary = coordinator.await_completion(Duration::from_secs(5)).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(suite.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_abandons_runs() {
        let suite = Arc::new(FakeSuite::hanging());
        let (coordinator, registry, ports) = setup(two_simulators(), suite, 3, ios_only());

        coordinator.initialize().await.unwrap();
        coordinator
            .dispatch(&SuiteDescriptor::new("login", "true"))
            .unwrap();
        assert!(
            coordinator
                .tickets()
                .iter()
                .all(|t| t.status == RunStatus::Running)
        );
        assert_eq!(registry.get("sim-A").unwrap().state, DeviceState::InUse);

        let summary = coordinator
            .await_completion(Duration::from_millis(50))
            .await;

        assert_eq!(summary.abandoned, 2);
        assert_eq!(summary.failed, 2);
        assert!(coordinator.tickets().iter().all(|t| t.is_abandoned()));
        assert_eq!(ports.len(), 2);

        coordinator.cleanup_all().await;
        assert!(ports.is_empty());
        assert!(registry.devices().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (coordinator, registry, ports) =
            setup(two_simulators(), Arc::new(FakeSuite::default()), 3, ios_only());

        coordinator.initialize().await.unwrap();
        coordinator.cleanup("sim-A").await;
        coordinator.cleanup("sim-A").await;
        coordinator.cleanup("unknown").await;

        assert!(registry.get("sim-A").is_none());
        assert_eq!(ports.assignments().into_keys().collect::<Vec<_>>(), vec!["sim-B"]);

        coordinator.cleanup_all().await;
        coordinator.cleanup_all().await;
        assert!(ports.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_after_cleanup_all_fails() {
        let (coordinator, _registry, _ports) =
            setup(two_simulators(), Arc::new(FakeSuite::default()), 3, ios_only());

        coordinator.initialize().await.unwrap();
        coordinator.cleanup_all().await;

        assert!(coordinator
            .dispatch(&SuiteDescriptor::new("login", "true"))
            .is_err());
    }
}
