//! Run tickets and the summary of one dispatch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::device::Platform;

/// Message recorded on tickets whose run was cut off by the suite timeout.
pub const ABANDONED: &str = "abandoned";

/// Status of one device run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Tracks one run of a suite on one device.
#[derive(Debug, Clone, Serialize)]
pub struct RunTicket {
    pub run_id: uuid::Uuid,
    pub device_id: String,
    pub platform: Platform,
    pub display_name: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Runs of the suite so far, including the first.
    pub attempts: u32,
    pub status: RunStatus,
    pub message: Option<String>,
}

impl RunTicket {
    pub(crate) fn start(
        device_id: &str,
        platform: Platform,
        display_name: &str,
        port: u16,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            device_id: device_id.to_string(),
            platform,
            display_name: display_name.to_string(),
            port,
            started_at: Utc::now(),
            finished_at: None,
            attempts: 0,
            status: RunStatus::Running,
            message: None,
        }
    }

    /// Records a terminal status. Tickets already finished are left alone.
    pub(crate) fn finish(&mut self, status: RunStatus, message: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.message = message;
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn is_abandoned(&self) -> bool {
        self.status == RunStatus::Failed && self.message.as_deref() == Some(ABANDONED)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

/// Aggregated results of one dispatch.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every run passed or was skipped |
/// | 1 | At least one run failed or was abandoned |
/// | 2 | Every run passed, some only after a retry |
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    /// Failed runs, abandoned runs included.
    pub failed: usize,
    pub skipped: usize,
    pub abandoned: usize,
    /// Runs beyond the first across all devices.
    pub retries: usize,
    /// Runs that passed only after a retry.
    pub flaky: usize,
    pub duration: Duration,
    pub tickets: Vec<RunTicket>,
}

impl RunSummary {
    pub fn from_tickets(tickets: Vec<RunTicket>, duration: Duration) -> Self {
        let count = |status: RunStatus| tickets.iter().filter(|t| t.status == status).count();

        Self {
            total: tickets.len(),
            passed: count(RunStatus::Passed),
            failed: count(RunStatus::Failed),
            skipped: count(RunStatus::Skipped),
            abandoned: tickets.iter().filter(|t| t.is_abandoned()).count(),
            retries: tickets
                .iter()
                .map(|t| t.attempts.saturating_sub(1) as usize)
                .sum(),
            flaky: tickets
                .iter()
                .filter(|t| t.status == RunStatus::Passed && t.attempts > 1)
                .count(),
            duration,
            tickets,
        }
    }

    /// Returns `true` if no run failed and at least one run happened.
    pub fn success(&self) -> bool {
        self.total > 0 && self.failed == 0
    }

    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            1
        } else if self.flaky > 0 {
            2
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(device: &str, status: RunStatus, attempts: u32, message: Option<&str>) -> RunTicket {
        let mut ticket = RunTicket::start(device, Platform::Ios, device, 4724);
        ticket.attempts = attempts;
        ticket.finish(status, message.map(str::to_string));
        ticket
    }

    #[test]
    fn test_finish_is_first_writer_wins() {
        let mut ticket = RunTicket::start("sim-A", Platform::Ios, "iPhone 15", 4724);
        assert!(ticket.finish(RunStatus::Failed, Some(ABANDONED.to_string())));
        assert!(!ticket.finish(RunStatus::Passed, None));
        assert!(ticket.is_abandoned());
        assert!(ticket.elapsed().is_some());
    }

    #[test]
    fn test_summary_counts() {
        let summary = RunSummary::from_tickets(
            vec![
                ticket("sim-A", RunStatus::Passed, 1, None),
                ticket("sim-B", RunStatus::Passed, 3, None),
                ticket("emulator-5554", RunStatus::Skipped, 1, None),
                ticket("R58M", RunStatus::Failed, 1, Some(ABANDONED)),
            ],
            Duration::from_secs(5),
        );

        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.abandoned, 1);
        assert_eq!(summary.retries, 2);
        assert_eq!(summary.flaky, 1);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_exit_codes() {
        let clean = RunSummary::from_tickets(
            vec![ticket("sim-A", RunStatus::Passed, 1, None)],
            Duration::ZERO,
        );
        assert!(clean.success());
        assert_eq!(clean.exit_code(), 0);

        let flaky = RunSummary::from_tickets(
            vec![ticket("sim-A", RunStatus::Passed, 2, None)],
            Duration::ZERO,
        );
        assert_eq!(flaky.exit_code(), 2);

        let empty = RunSummary::from_tickets(Vec::new(), Duration::ZERO);
        assert!(!empty.success());
    }
}
