//! Bounded per-test retry decisions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Decides whether a failed test identity gets another run.
///
/// Each identity may be retried up to `max_attempts` times. Passing clears
/// the identity's counter; an exhausted identity stays exhausted.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    state: Arc<Mutex<RetryState>>,
}

#[derive(Default)]
struct RetryState {
    /// Retries granted so far, per identity.
    attempts: HashMap<String, u32>,
    retries_granted: usize,
    passed_after_retry: usize,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            state: Arc::new(Mutex::new(RetryState::default())),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Grants a retry for `test_id` if its budget is not used up.
    ///
    /// Returns `true` (and counts the retry) exactly `max_attempts` times per
    /// identity, then `false` until the identity passes.
    pub fn should_retry(&self, test_id: &str) -> bool {
        let mut state = self.lock();
        let count = state.attempts.entry(test_id.to_string()).or_insert(0);
        if *count < self.max_attempts {
            *count += 1;
            let granted = *count;
            state.retries_granted += 1;
            debug!(
                "Retry {}/{} granted for {}",
                granted, self.max_attempts, test_id
            );
            true
        } else {
            false
        }
    }

    /// Clears the retry counter of a passing identity.
    pub fn record_pass(&self, test_id: &str) {
        let mut state = self.lock();
        if let Some(count) = state.attempts.remove(test_id)
            && count > 0
        {
            state.passed_after_retry += 1;
        }
    }

    /// Retries granted so far for `test_id`.
    pub fn attempts(&self, test_id: &str) -> u32 {
        self.lock().attempts.get(test_id).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> RetryStats {
        let state = self.lock();
        RetryStats {
            tracked: state.attempts.len(),
            total_retries: state.retries_granted,
            flaky: state.passed_after_retry,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Statistics about retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryStats {
    /// Identities that still hold a retry counter.
    pub tracked: usize,
    /// Retries granted across all identities.
    pub total_retries: usize,
    /// Identities that passed after at least one retry.
    pub flaky: usize,
}
