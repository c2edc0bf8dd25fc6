//! Paginated, retrying reader over a [`LedgerIndexer`].

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};

use super::{LedgerError, LedgerIndexer, RawEvent};
use crate::utils::retry::ledger_backoff;

/// Everything one source yielded in one cycle.
///
/// `fetch` never fails outright: a query error is reported alongside the
/// events collected before it.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub events: Vec<RawEvent>,
    /// Error that ended pagination early, after retries.
    pub error: Option<LedgerError>,
    /// Stopped at the page cap with more results pending.
    pub truncated: bool,
    /// Latest ledger position reported by the indexer.
    pub head: Option<u64>,
}

impl FetchOutcome {
    /// Whether every event at or after `min_position` was returned.
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && !self.truncated
    }

    /// Highest position among the returned events.
    pub fn last_position(&self) -> Option<u64> {
        self.events.iter().map(|e| e.position).max()
    }
}

#[derive(Clone)]
pub struct LedgerQueryClient {
    indexer: Arc<dyn LedgerIndexer>,
    page_cap: usize,
    retry_base: Duration,
    retry_attempts: u32,
}

impl LedgerQueryClient {
    pub fn new(
        indexer: Arc<dyn LedgerIndexer>,
        page_cap: usize,
        retry_base: Duration,
        retry_attempts: u32,
    ) -> Self {
        Self {
            indexer,
            page_cap: page_cap.max(1),
            retry_base,
            retry_attempts: retry_attempts.max(1),
        }
    }

    /// Collect events for `source_id` at or after `min_position`.
    ///
    /// Follows continuation tokens until exhausted or the page cap is hit.
    /// Transient failures are retried with exponential backoff; anything
    /// else stops pagination and is returned in [`FetchOutcome::error`].
    pub async fn fetch(&self, source_id: &str, min_position: u64) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        let mut next: Option<String> = None;

        loop {
            let indexer = &self.indexer;
            let continuation = next.as_deref();

            let result = (|| async move { indexer.search(source_id, min_position, continuation).await })
                .retry(ledger_backoff(self.retry_base, self.retry_attempts))
                .when(LedgerError::is_transient)
                .notify(|err: &LedgerError, dur: Duration| {
                    warn!(source_id = %source_id, error = %err, delay = ?dur, "Indexer query failed, retrying");
                })
                .await;

            let page = match result {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        source_id = %source_id,
                        collected = outcome.events.len(),
                        error = %e,
                        "Indexer query gave up, returning partial results"
                    );
                    outcome.error = Some(e);
                    break;
                }
            };

            if page.head.is_some() {
                outcome.head = page.head;
            }
            let page_empty = page.events.is_empty();
            outcome.events.extend(page.events);
            next = page.next;

            if next.is_none() || page_empty {
                break;
            }
            if outcome.events.len() >= self.page_cap {
                info!(
                    source_id = %source_id,
                    collected = outcome.events.len(),
                    cap = self.page_cap,
                    "Page cap reached, deferring remainder to next cycle"
                );
                outcome.truncated = true;
                break;
            }
        }

        outcome
    }
}
