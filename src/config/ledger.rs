//! External service configuration: ledger indexer and asset issuance.

use std::time::Duration;

use serde::Deserialize;

/// Ledger indexer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Base URL of the indexer (e.g. `https://testnet-idx.algonode.cloud`).
    pub indexer_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Events collected per source per cycle before deferring the rest.
    pub page_cap: usize,
    /// First retry delay for transient query failures.
    pub retry_base_delay_ms: u64,
    /// Total attempts per page, including the first.
    pub retry_attempts: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            indexer_url: "http://localhost:8980".to_string(),
            request_timeout_secs: 15,
            page_cap: 1000,
            retry_base_delay_ms: 2_000,
            retry_attempts: 4,
        }
    }
}

impl LedgerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Issuance service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    /// Base URL of the issuance service.
    pub endpoint: String,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Worker threads dedicated to issuance calls.
    pub workers: usize,
    /// Upper bound for one issue/deliver call, including queueing.
    pub call_timeout_ms: u64,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8090".to_string(),
            request_timeout_secs: 30,
            workers: 4,
            call_timeout_ms: 60_000,
        }
    }
}

impl IssuanceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
