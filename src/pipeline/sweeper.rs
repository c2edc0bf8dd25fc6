//! Retry sweeper for unprocessed payment records.
//!
//! Runs beside the reconciliation loop on its own cadence. The delay between
//! sweeps doubles after every sweep that saw failures and resets after a
//! clean one. Records that exhaust their budget are abandoned: marked
//! processed without their reward and logged at error level for manual
//! reconciliation.
//!
//! A record still claimed by an in-flight pass is left alone until its claim
//! lapses, so the sweeper never issues for a payment the loop is applying.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::metrics::PipelineMetrics;
use super::processor::EventProcessor;
use crate::config::SweeperConfig;
use crate::rewards::{FailureKind, MembershipLedger};
use crate::storage::{PaymentRecord, PaymentStore, Result};
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    /// Records another pass claimed between selection and retry.
    pub contended: usize,
    pub recovered: usize,
    pub failed: usize,
    pub abandoned: usize,
    /// Memberships deactivated on this sweep.
    pub expired: u64,
}

impl SweepReport {
    fn is_clean(&self) -> bool {
        self.failed == 0 && self.abandoned == 0
    }
}

pub struct RetrySweeper {
    payments: PaymentStore,
    memberships: MembershipLedger,
    processor: EventProcessor,
    metrics: Arc<PipelineMetrics>,
    config: SweeperConfig,
    policy: RetryPolicy,
}

impl RetrySweeper {
    pub fn new(
        payments: PaymentStore,
        memberships: MembershipLedger,
        processor: EventProcessor,
        metrics: Arc<PipelineMetrics>,
        config: SweeperConfig,
    ) -> Self {
        let policy = RetryPolicy::for_sweeper(config.base_interval(), config.max_interval(), config.max_attempts);
        Self {
            payments,
            memberships,
            processor,
            metrics,
            config,
            policy,
        }
    }

    /// Retry one batch of records observed at least `min_age_secs` before `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>, shutdown: &watch::Receiver<bool>) -> Result<SweepReport> {
        let mut report = SweepReport {
            expired: self.memberships.expire_stale(now).await?,
            ..Default::default()
        };
        if report.expired > 0 {
            info!(expired = report.expired, "Expired memberships deactivated");
        }

        let stale_claims = now - self.config.claim_lease();
        let batch = self
            .payments
            .unprocessed(now - self.config.min_age(), stale_claims, self.config.batch_size)
            .await?;

        for record in batch {
            if *shutdown.borrow() {
                break;
            }
            if !self.payments.claim(record.id, now, stale_claims).await? {
                debug!(event_id = %record.event_id, "Payment claimed by another pass, skipping");
                report.contended += 1;
                continue;
            }
            report.examined += 1;
            self.retry(&record, &mut report).await?;
        }

        Ok(report)
    }

    async fn retry(&self, record: &PaymentRecord, report: &mut SweepReport) -> Result<()> {
        if !self.policy.should_retry(record.attempts) {
            let reason = record.last_error.as_deref().unwrap_or("retry budget exhausted");
            return self.abandon(record, record.attempts, reason, report).await;
        }

        match self.processor.apply(record).await {
            Ok(_) => {
                self.payments.mark_processed(record.id).await?;
                self.metrics.retry_succeeded();
                report.recovered += 1;
                info!(event_id = %record.event_id, attempts = record.attempts, "Retry recovered payment");
            }
            Err(e) => {
                let attempts = record.attempts + 1;
                let reason = e.to_string();
                self.metrics.retry_failed();

                let permanent = e.kind() == FailureKind::Permanent;
                if (permanent && record.attempts >= 1) || !self.policy.should_retry(attempts) {
                    self.abandon(record, attempts, &reason, report).await?;
                } else {
                    self.payments.record_retry_failure(record.id, &reason).await?;
                    report.failed += 1;
                    warn!(
                        event_id = %record.event_id,
                        attempts,
                        permanent,
                        error = %reason,
                        "Retry failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn abandon(
        &self,
        record: &PaymentRecord,
        attempts: u32,
        reason: &str,
        report: &mut SweepReport,
    ) -> Result<()> {
        self.payments.abandon(record.id, attempts, reason).await?;
        self.metrics.record_abandoned();
        report.abandoned += 1;
        error!(
            event_id = %record.event_id,
            source_id = %record.source_id,
            payer = %record.payer,
            payee = %record.payee,
            amount = record.amount,
            memo = %record.memo,
            attempts,
            error = %reason,
            "Payment abandoned, manual reconciliation required"
        );
        Ok(())
    }

    /// Sweep until shutdown. The first sweep waits one base interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            base_interval_ms = self.config.base_interval_ms,
            max_attempts = self.config.max_attempts,
            "Retry sweeper started"
        );
        let mut failed_sweeps = 0u32;

        loop {
            let delay = self.policy.delay_for_attempt(failed_sweeps);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.sweep_once(Utc::now(), &shutdown).await {
                Ok(report) if report.is_clean() => {
                    if report.examined > 0 {
                        debug!(recovered = report.recovered, "Sweep complete");
                    }
                    failed_sweeps = 0;
                }
                Ok(report) => {
                    failed_sweeps = failed_sweeps.saturating_add(1);
                    info!(
                        examined = report.examined,
                        recovered = report.recovered,
                        failed = report.failed,
                        abandoned = report.abandoned,
                        next_delay_ms = self.policy.delay_for_attempt(failed_sweeps).as_millis() as u64,
                        "Sweep complete with failures"
                    );
                }
                Err(e) => {
                    failed_sweeps = failed_sweeps.saturating_add(1);
                    error!(error = %e, "Retry sweep failed");
                }
            }
        }

        info!("Retry sweeper stopped");
    }
}
