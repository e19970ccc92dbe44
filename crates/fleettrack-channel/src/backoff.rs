//! Reconnection backoff policy.
//!
//! All reconnect pacing lives here so callers never duplicate retry logic:
//! the channel's state machine is the single source of truth for connection
//! attempts.

use std::time::Duration;

/// Exponential backoff with a delay cap and a retry budget.
///
/// The delay for attempt `n` (zero-based) is `min(base * 2^n, max)`. The
/// attempt counter is managed by the channel and resets to zero whenever a
/// connection reaches the connected state.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Consecutive failures after which automatic retries stop.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// The delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether the retry budget is spent after `failures` consecutive failures.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}
