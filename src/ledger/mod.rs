//! Ledger access: indexer queries, pagination, and log payload decoding.
//!
//! ```text
//! LedgerIndexer (HTTP) --> LedgerQueryClient (pages, retry, cap) --> decode --> PaymentEvent
//! ```

mod client;
pub mod decoder;
mod indexer;

use async_trait::async_trait;

pub use client::{FetchOutcome, LedgerQueryClient};
pub use decoder::{decode, PaymentEvent};
pub use indexer::HttpIndexer;

/// One application call observed on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Ledger transaction id, the idempotency key for everything downstream.
    pub id: String,
    /// Confirmation position (round).
    pub position: u64,
    /// Base64 log emitted by the call, if any.
    pub payload: Option<String>,
}

/// One page of indexer results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub events: Vec<RawEvent>,
    pub next: Option<String>,
    /// Latest position known to the indexer.
    pub head: Option<u64>,
}

/// Errors returned by the ledger indexer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("Indexer request timed out: {0}")]
    Timeout(String),

    #[error("Indexer connection failed: {0}")]
    Connect(String),

    #[error("Indexer unavailable: {0}")]
    Unavailable(String),

    #[error("Indexer rejected request: {0}")]
    Rejected(String),

    #[error("Indexer response malformed: {0}")]
    Decode(String),
}

impl LedgerError {
    /// Timeouts, connection failures and unavailable-class responses.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Timeout(_) | LedgerError::Connect(_) | LedgerError::Unavailable(_)
        )
    }
}

/// The ledger's public query service.
#[async_trait]
pub trait LedgerIndexer: Send + Sync {
    /// Application calls to `source_id` at or after `min_position`.
    async fn search(
        &self,
        source_id: &str,
        min_position: u64,
        continuation: Option<&str>,
    ) -> Result<SearchPage, LedgerError>;
}
