//! Shared storage helper functions.
//!
//! Timestamp and integer conversions used by every SQLite-backed store.
//! Timestamps are stored as fixed-width RFC 3339 UTC text so that string
//! comparison in SQL orders them chronologically.

use chrono::{DateTime, SecondsFormat, Utc};

use super::{Result, StorageError};

/// Render a timestamp for storage.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(value.to_string()))
}

/// Parse an optional stored timestamp.
pub fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// Ledger positions and amounts are unsigned; SQLite integers are signed.
pub fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Inverse of [`to_sql_int`]; negative values clamp to zero.
pub fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests;
