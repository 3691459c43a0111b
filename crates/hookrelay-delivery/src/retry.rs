//! Exponential backoff schedule for failed deliveries.
//!
//! `delay(attempt) = min(max_delay, base_delay * 2^(attempt - 1))` with a
//! 1-indexed attempt: the first retry after the first failure waits
//! `base_delay`. The schedule is deterministic; no jitter is applied.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// Default ceiling for any single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(300_000);

/// Pure mapping from attempt count to backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryScheduler {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for every delay.
    pub max_delay: Duration,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self { base_delay: DEFAULT_BASE_DELAY, max_delay: DEFAULT_MAX_DELAY }
    }
}

impl RetryScheduler {
    /// Creates a scheduler with the given base and maximum delay.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    /// Returns the backoff delay for a 1-indexed attempt.
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = 2_u32.saturating_pow(exponent);

        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Returns the backoff delay in whole milliseconds.
    pub fn next_delay_ms(&self, attempt: u32) -> u64 {
        u64::try_from(self.next_delay(attempt).as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the earliest time a delivery that has failed `attempt` times
    /// may be retried.
    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.next_delay(attempt))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
