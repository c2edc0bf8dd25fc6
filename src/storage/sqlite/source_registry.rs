//! Registry of active payment sources.
//!
//! Read fresh by every reconciliation cycle so that newly activated
//! sources are picked up without a restart.

use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::storage::helpers::format_timestamp;
use crate::storage::schema::PaymentSources;
use crate::storage::Result;

/// A ledger application emitting payment logs for one payee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSource {
    pub source_id: String,
    pub payee: String,
}

#[derive(Clone)]
pub struct SourceRegistry {
    pool: SqlitePool,
}

impl SourceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register or re-activate a source.
    pub async fn register(&self, source_id: &str, payee: &str) -> Result<()> {
        let query = Query::insert()
            .into_table(PaymentSources::Table)
            .columns([
                PaymentSources::SourceId,
                PaymentSources::Payee,
                PaymentSources::Active,
                PaymentSources::RegisteredAt,
            ])
            .values_panic([
                source_id.into(),
                payee.into(),
                1i32.into(),
                format_timestamp(chrono::Utc::now()).into(),
            ])
            .on_conflict(
                OnConflict::column(PaymentSources::SourceId)
                    .update_columns([PaymentSources::Payee, PaymentSources::Active])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Stop polling a source. Returns whether it was active.
    pub async fn deactivate(&self, source_id: &str) -> Result<bool> {
        let query = Query::update()
            .table(PaymentSources::Table)
            .value(PaymentSources::Active, 0)
            .and_where(Expr::col(PaymentSources::SourceId).eq(source_id))
            .and_where(Expr::col(PaymentSources::Active).eq(1))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn active_sources(&self) -> Result<Vec<PaymentSource>> {
        let query = Query::select()
            .columns([PaymentSources::SourceId, PaymentSources::Payee])
            .from(PaymentSources::Table)
            .and_where(Expr::col(PaymentSources::Active).eq(1))
            .order_by(PaymentSources::SourceId, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<PaymentSource> {
                Ok(PaymentSource {
                    source_id: row.try_get("source_id")?,
                    payee: row.try_get("payee")?,
                })
            })
            .collect()
    }
}
