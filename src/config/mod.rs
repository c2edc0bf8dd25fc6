//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod ledger;
mod pipeline;
mod rewards;
mod storage;

pub use ledger::{IssuanceConfig, LedgerConfig};
pub use pipeline::{PipelineConfig, SweeperConfig};
pub use rewards::{AssetTemplate, RewardsConfig, TemplateConfig};
pub use storage::StorageConfig;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tipsync.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TIPSYNC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TIPSYNC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TIPSYNC_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A payment source seeded into the registry at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Ledger application id emitting payment logs.
    pub source_id: String,
    /// Payee (creator) address the source pays.
    pub payee: String,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite storage configuration.
    pub storage: StorageConfig,
    /// Ledger indexer configuration.
    pub ledger: LedgerConfig,
    /// Issuance service configuration.
    pub issuance: IssuanceConfig,
    /// Reconciliation loop configuration.
    pub pipeline: PipelineConfig,
    /// Retry sweeper configuration.
    pub sweeper: SweeperConfig,
    /// Reward routing thresholds and templates.
    pub rewards: RewardsConfig,
    /// Sources registered on start-up. More may be registered at runtime.
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `tipsync.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or mis-route the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rewards.badge_interval == 0 {
            return Err(ConfigError::invalid("rewards.badge_interval", "must be at least 1"));
        }
        if self.rewards.membership_validity_days == 0 {
            return Err(ConfigError::invalid(
                "rewards.membership_validity_days",
                "must be at least 1",
            ));
        }
        for (field, prefix) in [
            ("rewards.order_prefix", &self.rewards.order_prefix),
            ("rewards.membership_prefix", &self.rewards.membership_prefix),
            ("rewards.token_prefix", &self.rewards.token_prefix),
        ] {
            if prefix.trim().is_empty() {
                return Err(ConfigError::invalid(field, "prefix must not be empty"));
            }
        }
        if self.ledger.retry_attempts == 0 {
            return Err(ConfigError::invalid("ledger.retry_attempts", "must be at least 1"));
        }
        if self.ledger.page_cap == 0 {
            return Err(ConfigError::invalid("ledger.page_cap", "must be at least 1"));
        }
        if self.issuance.workers == 0 {
            return Err(ConfigError::invalid("issuance.workers", "must be at least 1"));
        }
        if self.sweeper.batch_size == 0 {
            return Err(ConfigError::invalid("sweeper.batch_size", "must be at least 1"));
        }
        if self.sweeper.max_attempts == 0 {
            return Err(ConfigError::invalid("sweeper.max_attempts", "must be at least 1"));
        }
        // A record must stay claimed through its issue and deliver calls
        if self.sweeper.claim_lease_secs.saturating_mul(1000) <= self.issuance.call_timeout_ms.saturating_mul(2) {
            return Err(ConfigError::invalid(
                "sweeper.claim_lease_secs",
                format!(
                    "must exceed two issuance calls ({}ms each)",
                    self.issuance.call_timeout_ms
                ),
            ));
        }
        if self.pipeline.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "pipeline.failure_threshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Create config for testing: in-memory database, short intervals.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.storage.path = ":memory:".to_string();
        config.storage.max_connections = 1;
        config.ledger.retry_base_delay_ms = 1;
        config.pipeline.poll_interval_ms = 10;
        config.pipeline.backoff_ms = 20;
        config.sweeper.base_interval_ms = 10;
        config.sweeper.max_interval_ms = 40;
        config.sweeper.min_age_secs = 0;
        config.issuance.call_timeout_ms = 2_000;
        config
    }
}
