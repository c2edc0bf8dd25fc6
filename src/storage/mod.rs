//! Storage implementations.
//!
//! SQLite is the only backend. Every table the pipeline owns is created by
//! [`init_storage`]; reward-ledger tables are queried from `crate::rewards`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::StorageConfig;

pub mod helpers;
pub mod schema;
pub mod sqlite;

pub use sqlite::{NewPayment, PaymentRecord, PaymentSource, PaymentStore, SourceRegistry, SqliteCheckpointStore};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid {column} value: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Expected row missing from {table}: {key}")]
    MissingRow { table: &'static str, key: String },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persists the last fully-processed ledger position.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Current position, 0 if nothing was ever committed.
    async fn read(&self) -> Result<u64>;

    /// Persist `position` only if it is greater than the stored one.
    ///
    /// Returns whether the stored position moved.
    async fn advance(&self, position: u64) -> Result<bool>;
}

/// Open (or create) the database and apply the schema.
pub async fn init_storage(config: &StorageConfig) -> Result<SqlitePool> {
    info!(path = %config.path, "Opening SQLite storage");

    let in_memory = config.path == ":memory:";
    let options = if in_memory {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
    }
    .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool_options = if in_memory {
        // Each in-memory connection is its own database: keep exactly one
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
    };

    let pool = pool_options.connect_with(options).await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes if missing.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in schema::ALL_TABLES {
        sqlx::raw_sql(ddl).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let config = StorageConfig {
        path: ":memory:".to_string(),
        max_connections: 1,
        ..StorageConfig::default()
    };
    init_storage(&config).await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_storage_creates_file_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tipsync.db");
        let config = StorageConfig {
            path: path.to_string_lossy().into_owned(),
            ..StorageConfig::default()
        };

        let pool = init_storage(&config).await.unwrap();
        assert!(path.exists());

        // Applying the schema twice is harmless
        apply_schema(&pool).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for expected in [
            "checkpoint",
            "loyalty",
            "loyalty_journal",
            "memberships",
            "order_items",
            "orders",
            "payment_sources",
            "payments",
            "products",
            "redemptions",
            "utility_tokens",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }
}
