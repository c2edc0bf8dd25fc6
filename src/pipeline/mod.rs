//! The reconciliation pipeline.
//!
//! [`Pipeline`] wires storage, the ledger client, the issuance pool and the
//! reward ledgers together. [`Pipeline::start`] spawns the reconciliation
//! loop and the retry sweeper on the current runtime; the returned
//! [`PipelineHandle`] stops them and reports status.

pub mod metrics;
pub mod processor;
pub mod reconcile;
pub mod sweeper;

pub use metrics::{LoopState, PipelineMetrics, PipelineStatus};
pub use processor::{ApplyReport, EventProcessor, RewardOutcome};
pub use reconcile::{CycleReport, ReconcileLoop};
pub use sweeper::{RetrySweeper, SweepReport};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::issuance::{HttpIssuer, IssuanceError, IssuancePool, Issuer};
use crate::ledger::{HttpIndexer, LedgerError, LedgerIndexer, LedgerQueryClient};
use crate::rewards::RewardLedgers;
use crate::storage::{
    init_storage, CheckpointStore, PaymentStore, SourceRegistry, SqliteCheckpointStore, StorageError,
};

/// Errors assembling the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ledger client error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Issuance client error: {0}")]
    Issuance(#[from] IssuanceError),

    #[error("Failed to start issuance workers: {0}")]
    Workers(#[from] std::io::Error),
}

pub struct Pipeline {
    config: Config,
    ledgers: RewardLedgers,
    payments: PaymentStore,
    sources: SourceRegistry,
    checkpoint: Arc<SqliteCheckpointStore>,
    client: LedgerQueryClient,
    processor: EventProcessor,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        pool: SqlitePool,
        indexer: Arc<dyn LedgerIndexer>,
        issuer: Arc<dyn Issuer>,
        config: Config,
    ) -> Result<Self, PipelineError> {
        let issuance = IssuancePool::new(issuer, config.issuance.workers, config.issuance.call_timeout())?;
        let ledgers = RewardLedgers::new(pool.clone(), &config.rewards);
        let client = LedgerQueryClient::new(
            indexer,
            config.ledger.page_cap,
            config.ledger.retry_base_delay(),
            config.ledger.retry_attempts,
        );
        let processor = EventProcessor::new(ledgers.clone(), Arc::new(issuance), config.rewards.clone());

        Ok(Self {
            ledgers,
            payments: PaymentStore::new(pool.clone()),
            sources: SourceRegistry::new(pool.clone()),
            checkpoint: Arc::new(SqliteCheckpointStore::new(pool)),
            client,
            processor,
            metrics: Arc::new(PipelineMetrics::default()),
            config,
        })
    }

    /// Open storage, build the HTTP clients and register configured sources.
    pub async fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let pool = init_storage(&config.storage).await?;
        let indexer = HttpIndexer::new(&config.ledger.indexer_url, config.ledger.request_timeout())?;
        let issuer = HttpIssuer::new(&config.issuance.endpoint, config.issuance.request_timeout())?;

        let pipeline = Self::new(pool, Arc::new(indexer), Arc::new(issuer), config.clone())?;
        for source in &config.sources {
            pipeline.sources.register(&source.source_id, &source.payee).await?;
        }
        info!(sources = config.sources.len(), "Pipeline assembled");
        Ok(pipeline)
    }

    pub fn ledgers(&self) -> &RewardLedgers {
        &self.ledgers
    }

    pub fn payments(&self) -> &PaymentStore {
        &self.payments
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn checkpoint(&self) -> Arc<dyn CheckpointStore> {
        self.checkpoint.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// A reconciliation loop over this pipeline's stores and clients.
    pub fn reconcile_loop(&self) -> ReconcileLoop {
        ReconcileLoop::new(
            self.sources.clone(),
            self.checkpoint(),
            self.payments.clone(),
            self.client.clone(),
            self.processor.clone(),
            self.metrics(),
            self.config.pipeline.clone(),
        )
    }

    /// A retry sweeper over this pipeline's stores and clients.
    pub fn sweeper(&self) -> RetrySweeper {
        RetrySweeper::new(
            self.payments.clone(),
            self.ledgers.memberships.clone(),
            self.processor.clone(),
            self.metrics(),
            self.config.sweeper.clone(),
        )
    }

    /// Run a single reconciliation cycle in the foreground.
    pub async fn run_cycle(&self) -> Result<CycleReport, StorageError> {
        let (_stop, shutdown) = watch::channel(false);
        self.reconcile_loop().run_cycle(&shutdown).await
    }

    /// Run a single retry sweep in the foreground.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StorageError> {
        let (_stop, shutdown) = watch::channel(false);
        self.sweeper().sweep_once(now, &shutdown).await
    }

    /// Spawn both background loops.
    pub fn start(&self) -> PipelineHandle {
        let (stop, shutdown) = watch::channel(false);
        self.metrics.set_running(true);

        let reconcile = tokio::spawn(self.reconcile_loop().run(shutdown.clone()));
        let sweeper = tokio::spawn(self.sweeper().run(shutdown));
        info!("Pipeline started");

        PipelineHandle {
            stop,
            reconcile,
            sweeper,
            metrics: self.metrics(),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.metrics.snapshot()
    }
}

/// Handle to the running loops.
pub struct PipelineHandle {
    stop: watch::Sender<bool>,
    reconcile: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineHandle {
    pub fn status(&self) -> PipelineStatus {
        self.metrics.snapshot()
    }

    /// Signal both loops and wait for in-flight work to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);

        for (name, task) in [("reconcile", self.reconcile), ("sweeper", self.sweeper)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Pipeline task ended abnormally");
            }
        }

        self.metrics.set_running(false);
        info!("Pipeline stopped");
    }
}
