//! Loyalty accrual per (payer, payee).
//!
//! Every qualifying tip is journaled by event id before it is counted, so a
//! re-delivered event never counts twice. Counting is one atomic `UPDATE`;
//! the badge counter moves only when the new tip count is an exact multiple
//! of the badge interval.

use chrono::Utc;
use sea_query::{Expr, OnConflict, Order, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::storage::helpers::{format_timestamp, from_sql_int, to_sql_int};
use crate::storage::schema::{Loyalty, LoyaltyJournal};
use crate::storage::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoyaltyRecord {
    pub payer: String,
    pub payee: String,
    pub tip_count: u64,
    pub total_amount: u64,
    pub badges_earned: u64,
    pub last_badge_ref: Option<String>,
}

impl LoyaltyRecord {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            payer: row.try_get("payer")?,
            payee: row.try_get("payee")?,
            tip_count: from_sql_int(row.try_get("tip_count")?),
            total_amount: from_sql_int(row.try_get("total_amount")?),
            badges_earned: from_sql_int(row.try_get("badges_earned")?),
            last_badge_ref: row.try_get("last_badge_ref")?,
        })
    }
}

/// Journal row for one applied tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub event_id: String,
    pub earned_badge: bool,
    pub badge_number: Option<u64>,
    pub badge_ref: Option<String>,
}

impl JournalEntry {
    /// Badge earned by this tip but not yet issued.
    pub fn pending_badge(&self) -> Option<u64> {
        if self.earned_badge && self.badge_ref.is_none() {
            self.badge_number
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipOutcome {
    pub record: LoyaltyRecord,
    /// The event had already been applied; counts are unchanged.
    pub duplicate: bool,
    /// Badge number that still needs issuing for this event.
    pub pending_badge: Option<u64>,
}

#[derive(Clone)]
pub struct LoyaltyLedger {
    pool: SqlitePool,
    badge_interval: u64,
}

impl LoyaltyLedger {
    pub fn new(pool: SqlitePool, badge_interval: u64) -> Self {
        Self {
            pool,
            badge_interval: badge_interval.max(1),
        }
    }

    fn select_record() -> SelectStatement {
        Query::select()
            .columns([
                Loyalty::Payer,
                Loyalty::Payee,
                Loyalty::TipCount,
                Loyalty::TotalAmount,
                Loyalty::BadgesEarned,
                Loyalty::LastBadgeRef,
            ])
            .from(Loyalty::Table)
            .to_owned()
    }

    async fn fetch(conn: &mut SqliteConnection, payer: &str, payee: &str) -> Result<LoyaltyRecord> {
        let query = Self::select_record()
            .and_where(Expr::col(Loyalty::Payer).eq(payer))
            .and_where(Expr::col(Loyalty::Payee).eq(payee))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| StorageError::MissingRow {
                table: "loyalty",
                key: format!("{payer}/{payee}"),
            })?;
        LoyaltyRecord::from_row(&row)
    }

    async fn fetch_journal(conn: &mut SqliteConnection, event_id: &str) -> Result<Option<JournalEntry>> {
        let query = Query::select()
            .columns([
                LoyaltyJournal::EventId,
                LoyaltyJournal::EarnedBadge,
                LoyaltyJournal::BadgeNumber,
                LoyaltyJournal::BadgeRef,
            ])
            .from(LoyaltyJournal::Table)
            .and_where(Expr::col(LoyaltyJournal::EventId).eq(event_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.map(|row| -> Result<JournalEntry> {
            Ok(JournalEntry {
                event_id: row.try_get("event_id")?,
                earned_badge: row.try_get::<i64, _>("earned_badge")? != 0,
                badge_number: row.try_get::<Option<i64>, _>("badge_number")?.map(from_sql_int),
                badge_ref: row.try_get("badge_ref")?,
            })
        })
        .transpose()
    }

    /// Count one qualifying tip.
    pub async fn record_tip(
        &self,
        event_id: &str,
        payer: &str,
        payee: &str,
        amount: u64,
    ) -> Result<TipOutcome> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        let journal = Query::insert()
            .into_table(LoyaltyJournal::Table)
            .columns([
                LoyaltyJournal::EventId,
                LoyaltyJournal::Payer,
                LoyaltyJournal::Payee,
                LoyaltyJournal::Amount,
                LoyaltyJournal::CreatedAt,
            ])
            .values_panic([
                event_id.into(),
                payer.into(),
                payee.into(),
                to_sql_int(amount).into(),
                now.clone().into(),
            ])
            .on_conflict(OnConflict::column(LoyaltyJournal::EventId).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        let fresh = sqlx::query(&journal).execute(&mut *tx).await?.rows_affected() > 0;

        if !fresh {
            let entry = Self::fetch_journal(&mut *tx, event_id).await?;
            let record = Self::fetch(&mut *tx, payer, payee).await?;
            tx.commit().await?;
            debug!(event_id = %event_id, "Tip already counted");
            return Ok(TipOutcome {
                record,
                duplicate: true,
                pending_badge: entry.and_then(|e| e.pending_badge()),
            });
        }

        let seed = Query::insert()
            .into_table(Loyalty::Table)
            .columns([Loyalty::Payer, Loyalty::Payee, Loyalty::UpdatedAt])
            .values_panic([payer.into(), payee.into(), now.clone().into()])
            .on_conflict(
                OnConflict::columns([Loyalty::Payer, Loyalty::Payee])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&seed).execute(&mut *tx).await?;

        // All SET expressions see the pre-update row
        let increment = Query::update()
            .table(Loyalty::Table)
            .value(Loyalty::TipCount, Expr::col(Loyalty::TipCount).add(1))
            .value(
                Loyalty::TotalAmount,
                Expr::col(Loyalty::TotalAmount).add(to_sql_int(amount)),
            )
            .value(
                Loyalty::BadgesEarned,
                Expr::cust(format!(
                    "badges_earned + CASE WHEN (tip_count + 1) % {} = 0 THEN 1 ELSE 0 END",
                    self.badge_interval
                )),
            )
            .value(Loyalty::UpdatedAt, now)
            .and_where(Expr::col(Loyalty::Payer).eq(payer))
            .and_where(Expr::col(Loyalty::Payee).eq(payee))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&increment).execute(&mut *tx).await?;

        let record = Self::fetch(&mut *tx, payer, payee).await?;

        let pending_badge = if record.tip_count % self.badge_interval == 0 {
            let mark = Query::update()
                .table(LoyaltyJournal::Table)
                .value(LoyaltyJournal::EarnedBadge, 1)
                .value(LoyaltyJournal::BadgeNumber, to_sql_int(record.badges_earned))
                .and_where(Expr::col(LoyaltyJournal::EventId).eq(event_id))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&mark).execute(&mut *tx).await?;
            Some(record.badges_earned)
        } else {
            None
        };

        tx.commit().await?;

        if let Some(badge) = pending_badge {
            info!(payer = %payer, payee = %payee, badge, tip_count = record.tip_count, "Loyalty badge earned");
        }

        Ok(TipOutcome {
            record,
            duplicate: false,
            pending_badge,
        })
    }

    /// Store the issued badge reference for an event's earned badge.
    pub async fn attach_badge(
        &self,
        event_id: &str,
        payer: &str,
        payee: &str,
        badge_ref: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let journal = Query::update()
            .table(LoyaltyJournal::Table)
            .value(LoyaltyJournal::BadgeRef, badge_ref)
            .and_where(Expr::col(LoyaltyJournal::EventId).eq(event_id))
            .and_where(Expr::col(LoyaltyJournal::BadgeRef).is_null())
            .to_string(SqliteQueryBuilder);
        sqlx::query(&journal).execute(&mut *tx).await?;

        let ledger = Query::update()
            .table(Loyalty::Table)
            .value(Loyalty::LastBadgeRef, badge_ref)
            .and_where(Expr::col(Loyalty::Payer).eq(payer))
            .and_where(Expr::col(Loyalty::Payee).eq(payee))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&ledger).execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn journal_entry(&self, event_id: &str) -> Result<Option<JournalEntry>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_journal(&mut conn, event_id).await
    }

    pub async fn get(&self, payer: &str, payee: &str) -> Result<Option<LoyaltyRecord>> {
        let query = Self::select_record()
            .and_where(Expr::col(Loyalty::Payer).eq(payer))
            .and_where(Expr::col(Loyalty::Payee).eq(payee))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(LoyaltyRecord::from_row).transpose()
    }

    /// All of a payer's loyalty records, one per payee.
    pub async fn for_payer(&self, payer: &str) -> Result<Vec<LoyaltyRecord>> {
        let query = Self::select_record()
            .and_where(Expr::col(Loyalty::Payer).eq(payer))
            .order_by(Loyalty::Payee, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(LoyaltyRecord::from_row).collect()
    }

    /// A payee's top supporters by badges, then total tipped.
    pub async fn leaderboard(&self, payee: &str, limit: u64) -> Result<Vec<LoyaltyRecord>> {
        let query = Self::select_record()
            .and_where(Expr::col(Loyalty::Payee).eq(payee))
            .order_by(Loyalty::BadgesEarned, Order::Desc)
            .order_by(Loyalty::TotalAmount, Order::Desc)
            .limit(limit)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(LoyaltyRecord::from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    async fn ledger() -> LoyaltyLedger {
        LoyaltyLedger::new(test_pool().await, 5)
    }

    #[tokio::test]
    async fn test_fifth_tip_earns_one_badge() {
        let ledger = ledger().await;

        for i in 1..=5u64 {
            let outcome = ledger
                .record_tip(&format!("TX{i}"), "FAN", "CREATOR", 500_000)
                .await
                .unwrap();
            assert!(!outcome.duplicate);
            assert_eq!(outcome.record.tip_count, i);
            assert_eq!(outcome.pending_badge, if i == 5 { Some(1) } else { None });
        }

        let record = ledger.get("FAN", "CREATOR").await.unwrap().unwrap();
        assert_eq!(record.tip_count, 5);
        assert_eq!(record.badges_earned, 1);
        assert_eq!(record.total_amount, 2_500_000);
    }

    #[tokio::test]
    async fn test_badges_only_on_exact_multiples() {
        let ledger = LoyaltyLedger::new(test_pool().await, 3);

        let mut earned = Vec::new();
        for i in 1..=10u64 {
            let outcome = ledger.record_tip(&format!("TX{i}"), "FAN", "CREATOR", 1).await.unwrap();
            if let Some(badge) = outcome.pending_badge {
                earned.push((i, badge));
            }
        }

        assert_eq!(earned, vec![(3, 1), (6, 2), (9, 3)]);
        let record = ledger.get("FAN", "CREATOR").await.unwrap().unwrap();
        assert_eq!(record.badges_earned, 3);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_a_no_op() {
        let ledger = ledger().await;

        ledger.record_tip("TX1", "FAN", "CREATOR", 600_000).await.unwrap();
        let again = ledger.record_tip("TX1", "FAN", "CREATOR", 600_000).await.unwrap();

        assert!(again.duplicate);
        assert_eq!(again.record.tip_count, 1);
        assert_eq!(again.record.total_amount, 600_000);
        assert_eq!(again.pending_badge, None);
    }

    #[tokio::test]
    async fn test_pending_badge_survives_redelivery_until_attached() {
        let ledger = LoyaltyLedger::new(test_pool().await, 1);

        let first = ledger.record_tip("TX1", "FAN", "CREATOR", 1).await.unwrap();
        assert_eq!(first.pending_badge, Some(1));

        // Issuance failed; the retry sees the same pending badge
        let retry = ledger.record_tip("TX1", "FAN", "CREATOR", 1).await.unwrap();
        assert!(retry.duplicate);
        assert_eq!(retry.pending_badge, Some(1));
        assert_eq!(retry.record.badges_earned, 1);

        ledger.attach_badge("TX1", "FAN", "CREATOR", "ASA-77").await.unwrap();
        let after = ledger.record_tip("TX1", "FAN", "CREATOR", 1).await.unwrap();
        assert_eq!(after.pending_badge, None);
        assert_eq!(after.record.last_badge_ref.as_deref(), Some("ASA-77"));

        let entry = ledger.journal_entry("TX1").await.unwrap().unwrap();
        assert!(entry.earned_badge);
        assert_eq!(entry.badge_ref.as_deref(), Some("ASA-77"));
    }

    #[tokio::test]
    async fn test_pairs_are_independent() {
        let ledger = ledger().await;
        ledger.record_tip("TX1", "FAN", "CREATOR_A", 1).await.unwrap();
        ledger.record_tip("TX2", "FAN", "CREATOR_B", 1).await.unwrap();
        ledger.record_tip("TX3", "FAN", "CREATOR_B", 1).await.unwrap();

        let records = ledger.for_payer("FAN").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payee, "CREATOR_A");
        assert_eq!(records[0].tip_count, 1);
        assert_eq!(records[1].tip_count, 2);
    }

    #[tokio::test]
    async fn test_leaderboard_orders_by_badges_then_total() {
        let ledger = LoyaltyLedger::new(test_pool().await, 2);
        // BIG: 1 tip, large total, no badge. LOYAL: 2 tips, 1 badge.
        ledger.record_tip("TX1", "BIG", "CREATOR", 9_000_000).await.unwrap();
        ledger.record_tip("TX2", "LOYAL", "CREATOR", 1).await.unwrap();
        ledger.record_tip("TX3", "LOYAL", "CREATOR", 1).await.unwrap();
        ledger.record_tip("TX4", "SMALL", "CREATOR", 5).await.unwrap();

        let board = ledger.leaderboard("CREATOR", 10).await.unwrap();
        let payers: Vec<&str> = board.iter().map(|r| r.payer.as_str()).collect();
        assert_eq!(payers, vec!["LOYAL", "BIG", "SMALL"]);

        assert_eq!(ledger.leaderboard("CREATOR", 1).await.unwrap().len(), 1);
    }
}
