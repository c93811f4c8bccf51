//! Automation server process lifecycle.
//!
//! [`ServerLifecycleManager`] launches the local automation server, waits
//! until it accepts connections and stops it again.
//!
//! # States
//!
//! ```text
//!            start()                    probe ok
//!  Stopped ──────────► Starting ─────────────────► Running
//!     ▲                   │                           │
//!     │   spawn failure / │ probe budget exhausted    │ stop()
//!     └───────────────────┘                           ▼
//!     └─────────────────────────────────────────── Stopping
//! ```
//!
//! The whole start sequence runs under one async mutex, so concurrent
//! callers never launch or poll twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{OrchestratorError, OrchestratorResult, describe_budget};
use crate::process::{ChildProcess, Command, OutputMode, ProcessRunner};

/// Checks whether something is listening at an address.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, address: &str, port: u16) -> bool;
}

/// Probe that opens a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn is_alive(&self, address: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect((address, port))).await,
            Ok(Ok(_))
        )
    }
}

/// Lifecycle state of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    state: ServerState,
    child: Option<Box<dyn ChildProcess>>,
}

/// Owns the automation server process.
pub struct ServerLifecycleManager {
    config: ServerConfig,
    runner: Arc<dyn ProcessRunner>,
    probe: Arc<dyn LivenessProbe>,
    inner: Mutex<Inner>,
}

impl ServerLifecycleManager {
    pub fn new(
        config: ServerConfig,
        runner: Arc<dyn ProcessRunner>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            config,
            runner,
            probe,
            inner: Mutex::new(Inner {
                state: ServerState::Stopped,
                child: None,
            }),
        }
    }

    /// Launches the server and waits until it accepts connections.
    ///
    /// Returns immediately if the server is already running.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::ServerStartFailed`] if the process cannot be launched
    /// - [`OrchestratorError::ServerStartTimeout`] if the liveness budget runs out;
    ///   the launched process is killed
    pub async fn start(&self) -> OrchestratorResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == ServerState::Running {
            debug!("Automation server already running");
            return Ok(());
        }

        inner.state = ServerState::Starting;
        let cmd = self.command();
        info!("Starting automation server: {}", cmd.to_shell_string());

        let mut child = match self.runner.spawn(&cmd).await {
            Ok(child) => child,
            Err(e) => {
                inner.state = ServerState::Stopped;
                return Err(OrchestratorError::ServerStartFailed(e.to_string()));
            }
        };

        let attempts = self.config.liveness_attempts;
        let interval = self.config.liveness_interval();
        debug!(
            "Waiting for {}:{} ({})",
            self.config.address,
            self.config.port,
            describe_budget(attempts, interval)
        );

        for attempt in 1..=attempts {
            if self.probe.is_alive(&self.config.address, self.config.port).await {
                inner.state = ServerState::Running;
                inner.child = Some(child);
                info!("Automation server running at {}", self.url());
                return Ok(());
            }
            if let Ok(Some(code)) = child.try_wait() {
                warn!("Automation server exited early with code {}", code);
                break;
            }
            debug!("Automation server not reachable (attempt {}/{})", attempt, attempts);
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill unresponsive automation server: {}", e);
        }
        inner.state = ServerState::Stopped;
        Err(OrchestratorError::ServerStartTimeout {
            address: self.config.address.clone(),
            port: self.config.port,
            attempts,
        })
    }

    /// Stops the server. Failures are logged, never returned.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != ServerState::Running {
            return;
        }

        inner.state = ServerState::Stopping;
        if let Some(mut child) = inner.child.take() {
            match child.kill().await {
                Ok(()) => info!("Automation server stopped"),
                Err(e) => warn!("Error stopping automation server: {}", e),
            }
        }
        inner.state = ServerState::Stopped;
    }

    /// Current state. Waits for an in-flight start or stop to finish.
    pub async fn state(&self) -> ServerState {
        self.inner.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == ServerState::Running
    }

    /// `http://address:port` plus the configured base path.
    pub fn url(&self) -> String {
        let base = self
            .config
            .base_path
            .as_deref()
            .map(|p| format!("/{}", p.trim_matches('/')))
            .filter(|p| p != "/")
            .unwrap_or_default();
        format!("http://{}:{}{}", self.config.address, self.config.port, base)
    }

    /// The server launch command.
    pub fn command(&self) -> Command {
        let config = &self.config;
        let binary = shellexpand::full(&config.binary)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| config.binary.clone());

        let mut cmd = Command::new(binary)
            .args(["--address", config.address.as_str()])
            .args(["--port".to_string(), config.port.to_string()])
            .args([
                "--relaxed-security",
                "--session-override",
                "--log-timestamp",
                "--local-timezone",
            ])
            .args(["--allow-insecure", "chromedriver_autodownload"]);

        if let Some(base) = &config.base_path {
            cmd = cmd.args(["--base-path", base.as_str()]);
        }
        if !config.drivers.is_empty() {
            cmd = cmd.args(["--use-drivers".to_string(), config.drivers.join(",")]);
        }
        if !config.plugins.is_empty() {
            cmd = cmd.args(["--use-plugins".to_string(), config.plugins.join(",")]);
        }

        cmd.args(&config.extra_args).output(match &config.log_file {
            Some(path) => OutputMode::File(path.clone()),
            None => OutputMode::Null,
        })
    }
}
