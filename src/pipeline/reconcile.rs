//! Reconciliation loop: poll, route, commit.
//!
//! Each cycle reads every active source from the checkpoint, records and
//! routes the decoded payments, then advances the checkpoint. A reward
//! failure leaves its record unprocessed for the sweeper and the cycle moves
//! on. A storage failure aborts the cycle without advancing.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::metrics::{LoopState, PipelineMetrics};
use super::processor::EventProcessor;
use crate::config::PipelineConfig;
use crate::ledger::{decode, LedgerQueryClient};
use crate::storage::{CheckpointStore, NewPayment, PaymentRecord, PaymentStore, Result, SourceRegistry, StorageError};
use crate::utils::retry::RetryPolicy;

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub sources: usize,
    /// Raw events that did not decode as payments.
    pub skipped: usize,
    /// Payments not seen before this cycle.
    pub inserted: usize,
    pub processed: usize,
    pub failed: usize,
    pub query_errors: usize,
    /// Stopped by shutdown before every source was drained.
    pub interrupted: bool,
    /// Checkpoint after the cycle.
    pub checkpoint: u64,
    pub advanced: bool,
}

pub struct ReconcileLoop {
    sources: SourceRegistry,
    checkpoint: Arc<dyn CheckpointStore>,
    payments: PaymentStore,
    client: LedgerQueryClient,
    processor: EventProcessor,
    metrics: Arc<PipelineMetrics>,
    config: PipelineConfig,
    policy: RetryPolicy,
}

impl ReconcileLoop {
    pub fn new(
        sources: SourceRegistry,
        checkpoint: Arc<dyn CheckpointStore>,
        payments: PaymentStore,
        client: LedgerQueryClient,
        processor: EventProcessor,
        metrics: Arc<PipelineMetrics>,
        config: PipelineConfig,
    ) -> Self {
        let policy = RetryPolicy::for_reconcile(config.poll_interval(), config.backoff_cap(), config.failure_threshold);
        Self {
            sources,
            checkpoint,
            payments,
            client,
            processor,
            metrics,
            config,
            policy,
        }
    }

    /// Run one poll cycle.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleReport> {
        self.metrics.heartbeat();
        self.metrics.set_state(LoopState::Polling);

        let result = self.poll_and_commit(shutdown).await;
        self.metrics.set_state(LoopState::Idle);
        result
    }

    async fn poll_and_commit(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleReport> {
        let sources = self.sources.active_sources().await?;
        let checkpoint = self.checkpoint.read().await?;
        self.metrics.set_checkpoint(checkpoint);

        let mut report = CycleReport {
            sources: sources.len(),
            checkpoint,
            ..Default::default()
        };
        let mut highest = checkpoint;
        let mut ceiling: Option<u64> = None;

        'sources: for source in &sources {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }

            self.metrics.set_state(LoopState::Polling);
            let fetched = self.client.fetch(&source.source_id, checkpoint).await;

            if let Some(head) = fetched.head {
                self.metrics.observe_head(head);
            }
            if let Some(e) = &fetched.error {
                report.query_errors += 1;
                self.metrics.query_failed();
                warn!(
                    source_id = %source.source_id,
                    error = %e,
                    events = fetched.events.len(),
                    "Ledger query incomplete"
                );
            }
            if !fetched.is_complete() {
                // Hold the checkpoint at what this source actually returned
                let limit = fetched.last_position().unwrap_or(checkpoint);
                ceiling = Some(ceiling.map_or(limit, |c| c.min(limit)));
            }

            self.metrics.set_state(LoopState::Routing);
            for raw in &fetched.events {
                if *shutdown.borrow() {
                    report.interrupted = true;
                    break 'sources;
                }
                self.metrics.heartbeat();
                highest = highest.max(raw.position);

                let Some(event) = decode(raw) else {
                    debug!(event_id = %raw.id, position = raw.position, "Skipping non-payment event");
                    report.skipped += 1;
                    continue;
                };

                let payment = NewPayment {
                    event_id: event.event_id,
                    source_id: source.source_id.clone(),
                    position: event.position,
                    payer: event.payer,
                    payee: source.payee.clone(),
                    amount: event.amount,
                    memo: event.memo,
                };
                // A fresh row is claimed by this pass until apply releases it
                let Some(id) = self.payments.insert_if_absent(&payment, Utc::now()).await? else {
                    debug!(event_id = %payment.event_id, "Payment already recorded");
                    continue;
                };
                report.inserted += 1;

                let record = self.payments.get(id).await?.ok_or_else(|| StorageError::MissingRow {
                    table: "payments",
                    key: id.to_string(),
                })?;
                if self.apply(&record).await? {
                    report.processed += 1;
                } else {
                    report.failed += 1;
                }
            }
        }

        if report.interrupted {
            info!(checkpoint, "Cycle interrupted by shutdown, checkpoint unchanged");
            return Ok(report);
        }

        self.metrics.set_state(LoopState::Committing);
        let target = ceiling.map_or(highest, |c| highest.min(c));
        if target > checkpoint && self.checkpoint.advance(target).await? {
            self.metrics.checkpoint_advanced(target);
            report.checkpoint = target;
            report.advanced = true;
            debug!(from = checkpoint, to = target, "Checkpoint advanced");
        }

        Ok(report)
    }

    /// Route one fresh record. Returns whether its reward was applied.
    async fn apply(&self, record: &PaymentRecord) -> Result<bool> {
        match self.processor.apply(record).await {
            Ok(report) => {
                self.payments.mark_processed(record.id).await?;
                self.metrics.event_processed();
                debug!(event_id = %record.event_id, outcome = ?report.outcome, "Payment processed");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    event_id = %record.event_id,
                    payer = %record.payer,
                    error = %e,
                    "Reward application failed, left for retry"
                );
                self.payments.record_failure(record.id, &e.to_string()).await?;
                self.metrics.reward_failed();
                Ok(false)
            }
        }
    }

    /// Poll until shutdown. The first cycle starts immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            failure_threshold = self.config.failure_threshold,
            "Reconciliation loop started"
        );

        while !*shutdown.borrow() {
            let failed = match self.run_cycle(&shutdown).await {
                Ok(report) => {
                    if report.inserted > 0 || report.query_errors > 0 {
                        info!(
                            inserted = report.inserted,
                            processed = report.processed,
                            failed = report.failed,
                            query_errors = report.query_errors,
                            checkpoint = report.checkpoint,
                            "Reconciliation cycle complete"
                        );
                    }
                    report.query_errors > 0
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation cycle failed");
                    true
                }
            };

            let delay = if failed {
                let consecutive = self.metrics.cycle_failed();
                if !self.policy.should_retry(u32::try_from(consecutive).unwrap_or(u32::MAX)) {
                    let backoff = self.policy.extended_delay();
                    self.metrics.set_state(LoopState::Backoff);
                    warn!(
                        consecutive,
                        backoff_ms = backoff.as_millis() as u64,
                        "Repeated cycle failures, backing off"
                    );
                    backoff
                } else {
                    self.config.poll_interval()
                }
            } else {
                self.metrics.cycle_succeeded();
                self.config.poll_interval()
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.metrics.set_state(LoopState::Idle);
        info!("Reconciliation loop stopped");
    }
}
