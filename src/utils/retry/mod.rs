//! Retry cadence with exponential backoff and a cap.
//!
//! `RetryPolicy` paces the loops themselves (sweep interval, cycle backoff).
//! Per-call retries against the ledger indexer use `backon` builders from
//! [`ledger_backoff`], which add jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay for the first attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Maximum number of attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(240),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Policy for the retry sweeper: 60s, 120s, 240s, capped.
    pub fn for_sweeper(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay: base,
            max_delay: cap.max(base),
            max_attempts,
        }
    }

    /// Policy for the reconciliation loop.
    ///
    /// `max_attempts` is the number of consecutive failed cycles tolerated at
    /// the normal poll interval; past it the loop sleeps [`Self::extended_delay`].
    pub fn for_reconcile(poll_interval: Duration, backoff_cap: Duration, failure_threshold: u32) -> Self {
        Self {
            base_delay: poll_interval,
            max_delay: backoff_cap,
            max_attempts: failure_threshold,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// delay = base * 2^attempt, capped at max_delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped_ms)
    }

    /// One doubling of the base delay, capped.
    pub fn extended_delay(&self) -> Duration {
        self.delay_for_attempt(1)
    }

    /// Check if another attempt may be made after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Backoff for ledger indexer queries.
///
/// `attempts` counts the initial call, so a value of 4 allows three retries.
pub fn ledger_backoff(base: Duration, attempts: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(base)
        .with_max_delay(base.saturating_mul(8))
        .with_max_times(attempts.saturating_sub(1) as usize)
        .with_jitter()
}

#[cfg(test)]
mod tests;
