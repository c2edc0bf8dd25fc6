//! Shared helpers: tracing bootstrap, retry cadence, telemetry instruments.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
