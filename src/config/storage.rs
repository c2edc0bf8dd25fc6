//! Storage configuration types.

use serde::Deserialize;

/// SQLite storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path. `:memory:` opens a private in-memory database.
    pub path: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "tipsync.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}
