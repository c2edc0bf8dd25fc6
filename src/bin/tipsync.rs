//! tipsync: payment reconciliation daemon
//!
//! Polls the ledger indexer for payments to every registered source and
//! applies them to the reward ledgers until interrupted.
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - TIPSYNC_CONFIG: path to a YAML config file (optional)
//! - TIPSYNC__*: overrides, e.g. TIPSYNC__LEDGER__INDEXER_URL
//! - TIPSYNC_LOG: tracing filter (default: info)

use std::time::Duration;

use tracing::info;

use tipsync::config::Config;
use tipsync::pipeline::Pipeline;
use tipsync::utils::bootstrap::init_tracing;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let pipeline = Pipeline::from_config(&config).await?;
    let handle = pipeline.start();

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = handle.status();
                info!(
                    state = status.state.as_str(),
                    checkpoint = status.checkpoint_position,
                    lag = ?status.consumer_lag,
                    events_per_minute = status.events_per_minute,
                    consecutive_failures = status.error_count,
                    cycle_failures = status.cycle_failures,
                    abandoned = status.abandoned,
                    "Pipeline status"
                );
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown requested");
                break;
            }
        }
    }

    handle.stop().await;
    Ok(())
}
