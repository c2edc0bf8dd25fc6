//! Background loop configuration.

use std::time::Duration;

use serde::Deserialize;

/// Reconciliation loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Delay between poll cycles.
    pub poll_interval_ms: u64,
    /// Consecutive failed cycles before the loop enters backoff.
    pub failure_threshold: u32,
    /// Cap on the backoff sleep, which is otherwise twice the poll interval.
    pub backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            failure_threshold: 5,
            backoff_ms: 60_000,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Retry sweeper configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Delay before the first sweep and after every clean sweep.
    pub base_interval_ms: u64,
    /// Cap on the doubled delay after sweeps with failures.
    pub max_interval_ms: u64,
    /// Records examined per sweep.
    pub batch_size: u64,
    /// Failed retries before a record is abandoned.
    pub max_attempts: u32,
    /// Records younger than this are left to the reconciliation loop.
    pub min_age_secs: u64,
    /// How long a processing claim holds before another pass may take it.
    pub claim_lease_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 60_000,
            max_interval_ms: 240_000,
            batch_size: 10,
            max_attempts: 3,
            min_age_secs: 30,
            claim_lease_secs: 300,
        }
    }
}

impl SweeperConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn min_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.min_age_secs).unwrap_or(i64::MAX))
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.claim_lease_secs).unwrap_or(i64::MAX))
    }
}
