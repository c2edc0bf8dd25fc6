//! Payment record table: one row per decoded ledger event.
//!
//! `event_id` is the idempotency key. Rows are only ever inserted and then
//! mutated to record processing state; they are never deleted.
//!
//! A record is applied only by whoever holds its claim. The reconciliation
//! loop claims a record as it inserts it; the sweeper must win
//! [`PaymentStore::claim`] first. Every processing outcome releases the claim,
//! and a claim older than the lease may be taken over.

use chrono::{DateTime, Utc};
use sea_query::{Cond, Expr, Func, OnConflict, Order, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::storage::helpers::{format_timestamp, from_sql_int, parse_timestamp, to_sql_int};
use crate::storage::schema::Payments;
use crate::storage::Result;

/// A decoded payment ready to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub event_id: String,
    pub source_id: String,
    pub position: u64,
    pub payer: String,
    pub payee: String,
    pub amount: u64,
    pub memo: String,
}

/// A stored payment record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub id: i64,
    pub event_id: String,
    pub source_id: String,
    pub position: u64,
    pub payer: String,
    pub payee: String,
    pub amount: u64,
    pub memo: String,
    pub processed: bool,
    /// Failed sweeper retries so far.
    pub attempts: u32,
    pub abandoned: bool,
    pub last_error: Option<String>,
    pub observed_at: DateTime<Utc>,
    /// When the current claim was taken, if any.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            source_id: row.try_get("source_id")?,
            position: from_sql_int(row.try_get("position")?),
            payer: row.try_get("payer")?,
            payee: row.try_get("payee")?,
            amount: from_sql_int(row.try_get("amount")?),
            memo: row.try_get("memo")?,
            processed: row.try_get::<i64, _>("processed")? != 0,
            attempts: u32::try_from(row.try_get::<i64, _>("attempts")?).unwrap_or(u32::MAX),
            abandoned: row.try_get::<i64, _>("abandoned")? != 0,
            last_error: row.try_get("last_error")?,
            observed_at: parse_timestamp(&row.try_get::<String, _>("observed_at")?)?,
            claimed_at: row
                .try_get::<Option<String>, _>("claimed_at")?
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

/// SQLite-backed payment record store.
#[derive(Clone)]
pub struct PaymentStore {
    pool: SqlitePool,
}

impl PaymentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn select_all() -> SelectStatement {
        Query::select()
            .columns([
                Payments::Id,
                Payments::EventId,
                Payments::SourceId,
                Payments::Position,
                Payments::Payer,
                Payments::Payee,
                Payments::Amount,
                Payments::Memo,
                Payments::Processed,
                Payments::Attempts,
                Payments::Abandoned,
                Payments::LastError,
                Payments::ObservedAt,
                Payments::ClaimedAt,
            ])
            .from(Payments::Table)
            .to_owned()
    }

    /// Insert a record unless its event id was already seen.
    ///
    /// The new row is claimed by the caller as of `observed_at`. Returns the
    /// new row id, or `None` on conflict.
    pub async fn insert_if_absent(
        &self,
        payment: &NewPayment,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let query = Query::insert()
            .into_table(Payments::Table)
            .columns([
                Payments::EventId,
                Payments::SourceId,
                Payments::Position,
                Payments::Payer,
                Payments::Payee,
                Payments::Amount,
                Payments::Memo,
                Payments::ObservedAt,
                Payments::ClaimedAt,
            ])
            .values_panic([
                payment.event_id.as_str().into(),
                payment.source_id.as_str().into(),
                to_sql_int(payment.position).into(),
                payment.payer.as_str().into(),
                payment.payee.as_str().into(),
                to_sql_int(payment.amount).into(),
                payment.memo.as_str().into(),
                format_timestamp(observed_at).into(),
                format_timestamp(observed_at).into(),
            ])
            .on_conflict(OnConflict::column(Payments::EventId).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            Ok(None)
        } else {
            Ok(Some(result.last_insert_rowid()))
        }
    }

    pub async fn get(&self, id: i64) -> Result<Option<PaymentRecord>> {
        let query = Self::select_all()
            .and_where(Expr::col(Payments::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(PaymentRecord::from_row).transpose()
    }

    pub async fn get_by_event(&self, event_id: &str) -> Result<Option<PaymentRecord>> {
        let query = Self::select_all()
            .and_where(Expr::col(Payments::EventId).eq(event_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(PaymentRecord::from_row).transpose()
    }

    /// Take the claim on an unprocessed record.
    ///
    /// Wins when the record is unclaimed or its claim was taken before
    /// `stale_before`. Returns `false` if another pass holds it or it is
    /// already processed.
    pub async fn claim(&self, id: i64, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> Result<bool> {
        let query = Query::update()
            .table(Payments::Table)
            .value(Payments::ClaimedAt, format_timestamp(now))
            .cond_where(
                Cond::all()
                    .add(Expr::col(Payments::Id).eq(id))
                    .add(Expr::col(Payments::Processed).eq(0))
                    .add(unclaimed_since(stale_before)),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flip the processed flag after a successful reward mutation.
    pub async fn mark_processed(&self, id: i64) -> Result<()> {
        let query = Query::update()
            .table(Payments::Table)
            .value(Payments::Processed, 1)
            .value(Payments::LastError, Option::<String>::None)
            .value(Payments::ClaimedAt, Option::<String>::None)
            .and_where(Expr::col(Payments::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Note a first-pass failure from the reconciliation loop.
    ///
    /// Does not count against the retry budget.
    pub async fn record_failure(&self, id: i64, error: &str) -> Result<()> {
        let query = Query::update()
            .table(Payments::Table)
            .value(Payments::LastError, error)
            .value(Payments::ClaimedAt, Option::<String>::None)
            .and_where(Expr::col(Payments::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Count one failed sweeper retry.
    pub async fn record_retry_failure(&self, id: i64, error: &str) -> Result<()> {
        let query = Query::update()
            .table(Payments::Table)
            .value(Payments::Attempts, Expr::col(Payments::Attempts).add(1))
            .value(Payments::LastError, error)
            .value(Payments::ClaimedAt, Option::<String>::None)
            .and_where(Expr::col(Payments::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Give up on a record: processed without its reward.
    pub async fn abandon(&self, id: i64, attempts: u32, error: &str) -> Result<()> {
        let query = Query::update()
            .table(Payments::Table)
            .value(Payments::Processed, 1)
            .value(Payments::Abandoned, 1)
            .value(Payments::Attempts, i64::from(attempts))
            .value(Payments::LastError, error)
            .value(Payments::ClaimedAt, Option::<String>::None)
            .and_where(Expr::col(Payments::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Unprocessed records observed at or before `observed_before`, oldest
    /// first, skipping those claimed at or after `claimed_before`.
    pub async fn unprocessed(
        &self,
        observed_before: DateTime<Utc>,
        claimed_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<PaymentRecord>> {
        let query = Self::select_all()
            .cond_where(
                Cond::all()
                    .add(Expr::col(Payments::Processed).eq(0))
                    .add(Expr::col(Payments::ObservedAt).lte(format_timestamp(observed_before)))
                    .add(unclaimed_since(claimed_before)),
            )
            .order_by(Payments::Id, Order::Asc)
            .limit(limit)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(PaymentRecord::from_row).collect()
    }

    pub async fn count_unprocessed(&self) -> Result<u64> {
        let query = Query::select()
            .expr(Func::count(Expr::col(Payments::Id)))
            .from(Payments::Table)
            .and_where(Expr::col(Payments::Processed).eq(0))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        Ok(from_sql_int(row.try_get::<i64, _>(0)?))
    }
}

fn unclaimed_since(stale_before: DateTime<Utc>) -> Cond {
    Cond::any()
        .add(Expr::col(Payments::ClaimedAt).is_null())
        .add(Expr::col(Payments::ClaimedAt).lt(format_timestamp(stale_before)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    fn payment(event_id: &str, position: u64) -> NewPayment {
        NewPayment {
            event_id: event_id.to_string(),
            source_id: "42".to_string(),
            position,
            payer: "PAYER".to_string(),
            payee: "CREATOR".to_string(),
            amount: 500_000,
            memo: "gm".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_dedupes_on_event_id() {
        let store = PaymentStore::new(test_pool().await);
        let now = Utc::now();

        let first = store.insert_if_absent(&payment("TX1", 10), now).await.unwrap();
        assert!(first.is_some());

        let second = store.insert_if_absent(&payment("TX1", 11), now).await.unwrap();
        assert!(second.is_none());

        let record = store.get_by_event("TX1").await.unwrap().unwrap();
        assert_eq!(record.position, 10);
        assert!(!record.processed);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.amount, 500_000);
    }

    #[tokio::test]
    async fn test_mark_processed_clears_error() {
        let store = PaymentStore::new(test_pool().await);
        let id = store
            .insert_if_absent(&payment("TX1", 1), Utc::now())
            .await
            .unwrap()
            .unwrap();

        store.record_failure(id, "issuer down").await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.last_error.as_deref(), Some("issuer down"));
        assert_eq!(record.attempts, 0);

        store.mark_processed(id).await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert!(record.processed);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_retry_failures_and_abandon() {
        let store = PaymentStore::new(test_pool().await);
        let id = store
            .insert_if_absent(&payment("TX1", 1), Utc::now())
            .await
            .unwrap()
            .unwrap();

        store.record_retry_failure(id, "timeout").await.unwrap();
        store.record_retry_failure(id, "timeout").await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().attempts, 2);

        store.abandon(id, 3, "timeout").await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert!(record.processed);
        assert!(record.abandoned);
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn test_unprocessed_respects_age_and_limit() {
        let store = PaymentStore::new(test_pool().await);
        let old = Utc::now() - chrono::Duration::minutes(5);
        let fresh = Utc::now();

        let a = store.insert_if_absent(&payment("A", 1), old).await.unwrap().unwrap();
        let b = store.insert_if_absent(&payment("B", 2), old).await.unwrap().unwrap();
        store.insert_if_absent(&payment("C", 3), old).await.unwrap();
        store.insert_if_absent(&payment("D", 4), fresh).await.unwrap();
        store.mark_processed(b).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(30);
        let due = store.unprocessed(cutoff, Utc::now(), 10).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);

        let limited = store.unprocessed(cutoff, Utc::now(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, a);

        assert_eq!(store.count_unprocessed().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_claim_excludes_other_passes_until_released() {
        let store = PaymentStore::new(test_pool().await);
        let now = Utc::now();
        let lease = chrono::Duration::minutes(5);
        let id = store.insert_if_absent(&payment("TX1", 1), now).await.unwrap().unwrap();

        // Held by the inserting pass
        assert!(store.unprocessed(now, now - lease, 10).await.unwrap().is_empty());
        assert!(!store.claim(id, now, now - lease).await.unwrap());

        store.record_failure(id, "issuer down").await.unwrap();
        let due = store.unprocessed(now, now - lease, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].claimed_at.is_none());

        assert!(store.claim(id, now, now - lease).await.unwrap());
        assert!(!store.claim(id, now, now - lease).await.unwrap());

        store.mark_processed(id).await.unwrap();
        let later = now + chrono::Duration::hours(1);
        assert!(!store.claim(id, later, later - lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_claim_can_be_taken_over() {
        let store = PaymentStore::new(test_pool().await);
        let inserted = Utc::now() - chrono::Duration::minutes(10);
        let lease = chrono::Duration::minutes(5);
        let id = store.insert_if_absent(&payment("TX1", 1), inserted).await.unwrap().unwrap();

        let now = Utc::now();
        assert_eq!(store.unprocessed(now, now - lease, 10).await.unwrap().len(), 1);
        assert!(store.claim(id, now, now - lease).await.unwrap());

        let record = store.get(id).await.unwrap().unwrap();
        assert!(record.claimed_at.is_some_and(|at| at > inserted));
    }
}
