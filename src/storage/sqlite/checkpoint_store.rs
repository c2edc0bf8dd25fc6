//! SQLite CheckpointStore implementation.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::storage::helpers::{format_timestamp, from_sql_int, to_sql_int};
use crate::storage::schema::Checkpoint;
use crate::storage::{CheckpointStore, Result};

const SINGLETON_ID: i64 = 1;

/// SQLite implementation of CheckpointStore.
///
/// The forward-only rule is enforced by the upsert itself, so concurrent
/// callers can never move the stored position backwards.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn read(&self) -> Result<u64> {
        let query = Query::select()
            .column(Checkpoint::Position)
            .from(Checkpoint::Table)
            .and_where(Expr::col(Checkpoint::Id).eq(SINGLETON_ID))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Ok(from_sql_int(row.try_get::<i64, _>("position")?)),
            None => Ok(0),
        }
    }

    async fn advance(&self, position: u64) -> Result<bool> {
        let position = to_sql_int(position);
        let updated_at = format_timestamp(chrono::Utc::now());

        let query = Query::insert()
            .into_table(Checkpoint::Table)
            .columns([Checkpoint::Id, Checkpoint::Position, Checkpoint::UpdatedAt])
            .values_panic([SINGLETON_ID.into(), position.into(), updated_at.into()])
            .on_conflict(
                OnConflict::column(Checkpoint::Id)
                    .update_columns([Checkpoint::Position, Checkpoint::UpdatedAt])
                    .action_and_where(Expr::col((Checkpoint::Table, Checkpoint::Position)).lt(position))
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }
}
