//! OTel-native metrics instruments.
//!
//! Mirrors the in-memory pipeline counters onto OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("tipsync"));

/// Payment events decoded and routed.
pub static EVENTS_PROCESSED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tipsync.events.processed.total")
        .with_description("Payment events routed to a reward ledger")
        .build()
});

/// Reward mutations that failed and were left for the sweeper.
pub static REWARD_FAILURES_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tipsync.rewards.failures.total")
        .with_description("Reward mutations left unprocessed")
        .build()
});

/// Ledger indexer query failures after retries.
pub static QUERY_ERRORS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tipsync.ledger.query.errors.total")
        .with_description("Indexer queries that failed after retries")
        .build()
});

/// Records marked processed without their reward.
pub static ABANDONED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tipsync.sweeper.abandoned.total")
        .with_description("Payment records abandoned by the retry sweeper")
        .build()
});

/// Checkpoint advances committed.
pub static CHECKPOINT_ADVANCES_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tipsync.checkpoint.advances.total")
        .with_description("Checkpoint advances committed")
        .build()
});
