//! Time-bound memberships.
//!
//! At most one active membership exists per (payer, payee), enforced by a
//! partial unique index. A renewal bought while a membership is active
//! extends from its current expiry rather than from now.

use chrono::{DateTime, Duration, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::issuance::DeliveryStatus;
use crate::storage::helpers::{format_timestamp, from_sql_int, parse_timestamp, to_sql_int};
use crate::storage::schema::Memberships;
use crate::storage::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub id: i64,
    pub payer: String,
    pub payee: String,
    pub asset_ref: String,
    pub delivery_status: DeliveryStatus,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub purchase_event_id: String,
    pub amount_paid: u64,
}

impl Membership {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("delivery_status")?;
        Ok(Self {
            id: row.try_get("id")?,
            payer: row.try_get("payer")?,
            payee: row.try_get("payee")?,
            asset_ref: row.try_get("asset_ref")?,
            delivery_status: DeliveryStatus::parse(&status).ok_or(StorageError::InvalidValue {
                column: "delivery_status",
                value: status.clone(),
            })?,
            purchased_at: parse_timestamp(&row.try_get::<String, _>("purchased_at")?)?,
            expires_at: parse_timestamp(&row.try_get::<String, _>("expires_at")?)?,
            is_active: row.try_get::<i64, _>("is_active")? != 0,
            purchase_event_id: row.try_get("purchase_event_id")?,
            amount_paid: from_sql_int(row.try_get("amount_paid")?),
        })
    }
}

/// A paid membership whose asset has been issued.
#[derive(Debug, Clone)]
pub struct NewMembership {
    pub event_id: String,
    pub payer: String,
    pub payee: String,
    pub amount: u64,
    pub asset_ref: String,
    pub delivery_status: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseOutcome {
    Created(Membership),
    Renewed {
        membership: Membership,
        previous_expiry: DateTime<Utc>,
    },
    /// The purchase event was already applied.
    Duplicate(Membership),
}

impl PurchaseOutcome {
    pub fn membership(&self) -> &Membership {
        match self {
            PurchaseOutcome::Created(m) | PurchaseOutcome::Duplicate(m) => m,
            PurchaseOutcome::Renewed { membership, .. } => membership,
        }
    }
}

/// Result of checking a pair's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipStatus {
    pub valid: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_remaining: i64,
}

#[derive(Clone)]
pub struct MembershipLedger {
    pool: SqlitePool,
    validity: Duration,
}

impl MembershipLedger {
    pub fn new(pool: SqlitePool, validity: Duration) -> Self {
        Self { pool, validity }
    }

    fn select_all() -> SelectStatement {
        Query::select()
            .columns([
                Memberships::Id,
                Memberships::Payer,
                Memberships::Payee,
                Memberships::AssetRef,
                Memberships::DeliveryStatus,
                Memberships::PurchasedAt,
                Memberships::ExpiresAt,
                Memberships::IsActive,
                Memberships::PurchaseEventId,
                Memberships::AmountPaid,
            ])
            .from(Memberships::Table)
            .to_owned()
    }

    pub async fn find_by_event(&self, event_id: &str) -> Result<Option<Membership>> {
        let query = Self::select_all()
            .and_where(Expr::col(Memberships::PurchaseEventId).eq(event_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Membership::from_row).transpose()
    }

    /// Record a purchase: renew the active membership or start a new one.
    pub async fn purchase(&self, new: &NewMembership, now: DateTime<Utc>) -> Result<PurchaseOutcome> {
        let now_ts = format_timestamp(now);
        let mut tx = self.pool.begin().await?;

        let lapse = Query::update()
            .table(Memberships::Table)
            .value(Memberships::IsActive, 0)
            .and_where(Expr::col(Memberships::Payer).eq(new.payer.as_str()))
            .and_where(Expr::col(Memberships::Payee).eq(new.payee.as_str()))
            .and_where(Expr::col(Memberships::IsActive).eq(1))
            .and_where(Expr::col(Memberships::ExpiresAt).lte(now_ts.as_str()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&lapse).execute(&mut *tx).await?;

        let current = Self::select_all()
            .and_where(Expr::col(Memberships::Payer).eq(new.payer.as_str()))
            .and_where(Expr::col(Memberships::Payee).eq(new.payee.as_str()))
            .and_where(Expr::col(Memberships::IsActive).eq(1))
            .to_string(SqliteQueryBuilder);
        let current = match sqlx::query(&current).fetch_optional(&mut *tx).await? {
            Some(row) => Some(Membership::from_row(&row)?),
            None => None,
        };

        let previous_expiry = match &current {
            Some(active) => {
                let retire = Query::update()
                    .table(Memberships::Table)
                    .value(Memberships::IsActive, 0)
                    .and_where(Expr::col(Memberships::Id).eq(active.id))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&retire).execute(&mut *tx).await?;
                Some(active.expires_at)
            }
            None => None,
        };
        let expires_at = previous_expiry.unwrap_or(now) + self.validity;

        let insert = Query::insert()
            .into_table(Memberships::Table)
            .columns([
                Memberships::Payer,
                Memberships::Payee,
                Memberships::AssetRef,
                Memberships::DeliveryStatus,
                Memberships::PurchasedAt,
                Memberships::ExpiresAt,
                Memberships::IsActive,
                Memberships::PurchaseEventId,
                Memberships::AmountPaid,
            ])
            .values_panic([
                new.payer.as_str().into(),
                new.payee.as_str().into(),
                new.asset_ref.as_str().into(),
                new.delivery_status.as_str().into(),
                now_ts.into(),
                format_timestamp(expires_at).into(),
                1i32.into(),
                new.event_id.as_str().into(),
                to_sql_int(new.amount).into(),
            ])
            .on_conflict(OnConflict::column(Memberships::PurchaseEventId).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);
        let result = sqlx::query(&insert).execute(&mut *tx).await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let existing = self.find_by_event(&new.event_id).await?.ok_or_else(|| {
                StorageError::MissingRow {
                    table: "memberships",
                    key: new.event_id.clone(),
                }
            })?;
            debug!(event_id = %new.event_id, "Membership purchase already applied");
            return Ok(PurchaseOutcome::Duplicate(existing));
        }

        let id = result.last_insert_rowid();
        tx.commit().await?;

        let membership = Membership {
            id,
            payer: new.payer.clone(),
            payee: new.payee.clone(),
            asset_ref: new.asset_ref.clone(),
            delivery_status: new.delivery_status,
            purchased_at: now,
            expires_at,
            is_active: true,
            purchase_event_id: new.event_id.clone(),
            amount_paid: new.amount,
        };

        Ok(match previous_expiry {
            Some(previous_expiry) => {
                info!(
                    payer = %new.payer,
                    payee = %new.payee,
                    expires_at = %expires_at,
                    "Membership renewed"
                );
                PurchaseOutcome::Renewed {
                    membership,
                    previous_expiry,
                }
            }
            None => {
                info!(payer = %new.payer, payee = %new.payee, expires_at = %expires_at, "Membership created");
                PurchaseOutcome::Created(membership)
            }
        })
    }

    /// Check a pair's membership, deactivating it if it has expired.
    pub async fn verify(&self, payer: &str, payee: &str, now: DateTime<Utc>) -> Result<MembershipStatus> {
        let query = Self::select_all()
            .and_where(Expr::col(Memberships::Payer).eq(payer))
            .and_where(Expr::col(Memberships::Payee).eq(payee))
            .and_where(Expr::col(Memberships::IsActive).eq(1))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(MembershipStatus {
                valid: false,
                expires_at: None,
                days_remaining: 0,
            });
        };
        let membership = Membership::from_row(&row)?;

        if membership.expires_at <= now {
            let expire = Query::update()
                .table(Memberships::Table)
                .value(Memberships::IsActive, 0)
                .and_where(Expr::col(Memberships::Id).eq(membership.id))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&expire).execute(&self.pool).await?;
            debug!(payer = %payer, payee = %payee, "Membership expired on verify");

            return Ok(MembershipStatus {
                valid: false,
                expires_at: Some(membership.expires_at),
                days_remaining: 0,
            });
        }

        Ok(MembershipStatus {
            valid: true,
            expires_at: Some(membership.expires_at),
            days_remaining: (membership.expires_at - now).num_days(),
        })
    }

    /// Deactivate every active membership past its expiry.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = Query::update()
            .table(Memberships::Table)
            .value(Memberships::IsActive, 0)
            .and_where(Expr::col(Memberships::IsActive).eq(1))
            .and_where(Expr::col(Memberships::ExpiresAt).lte(format_timestamp(now)))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// A payer's unexpired memberships.
    pub async fn active_for(&self, payer: &str, now: DateTime<Utc>) -> Result<Vec<Membership>> {
        let query = Self::select_all()
            .and_where(Expr::col(Memberships::Payer).eq(payer))
            .and_where(Expr::col(Memberships::IsActive).eq(1))
            .and_where(Expr::col(Memberships::ExpiresAt).gt(format_timestamp(now)))
            .order_by(Memberships::ExpiresAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Membership::from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::storage::test_pool;

    fn purchase(event_id: &str, asset_ref: &str) -> NewMembership {
        NewMembership {
            event_id: event_id.to_string(),
            payer: "FAN".to_string(),
            payee: "CREATOR".to_string(),
            amount: 5_000_000,
            asset_ref: asset_ref.to_string(),
            delivery_status: DeliveryStatus::Delivered,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn ledger() -> MembershipLedger {
        MembershipLedger::new(test_pool().await, Duration::days(30))
    }

    #[tokio::test]
    async fn test_first_purchase_starts_from_now() {
        let ledger = ledger().await;
        let outcome = ledger.purchase(&purchase("TX1", "ASA-1"), t0()).await.unwrap();

        let PurchaseOutcome::Created(m) = outcome else {
            panic!("expected Created, got {outcome:?}");
        };
        assert_eq!(m.expires_at, t0() + Duration::days(30));
        assert!(m.is_active);
    }

    #[tokio::test]
    async fn test_renewal_extends_from_current_expiry() {
        let ledger = ledger().await;
        ledger.purchase(&purchase("TX1", "ASA-1"), t0()).await.unwrap();

        // Renew ten days in: expiry is T + 30d, not now + 30d
        let renew_at = t0() + Duration::days(10);
        let outcome = ledger.purchase(&purchase("TX2", "ASA-2"), renew_at).await.unwrap();

        let PurchaseOutcome::Renewed {
            membership,
            previous_expiry,
        } = outcome
        else {
            panic!("expected Renewed, got {outcome:?}");
        };
        assert_eq!(previous_expiry, t0() + Duration::days(30));
        assert_eq!(membership.expires_at, t0() + Duration::days(60));

        let old = ledger.find_by_event("TX1").await.unwrap().unwrap();
        assert!(!old.is_active);
        assert_eq!(ledger.active_for("FAN", renew_at).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purchase_after_expiry_starts_fresh() {
        let ledger = ledger().await;
        ledger.purchase(&purchase("TX1", "ASA-1"), t0()).await.unwrap();

        let later = t0() + Duration::days(45);
        let outcome = ledger.purchase(&purchase("TX2", "ASA-2"), later).await.unwrap();

        assert!(matches!(outcome, PurchaseOutcome::Created(_)));
        assert_eq!(outcome.membership().expires_at, later + Duration::days(30));
    }

    #[tokio::test]
    async fn test_duplicate_purchase_leaves_expiry_unchanged() {
        let ledger = ledger().await;
        ledger.purchase(&purchase("TX1", "ASA-1"), t0()).await.unwrap();

        let again = ledger
            .purchase(&purchase("TX1", "ASA-1b"), t0() + Duration::days(1))
            .await
            .unwrap();

        let PurchaseOutcome::Duplicate(m) = again else {
            panic!("expected Duplicate, got {again:?}");
        };
        assert_eq!(m.expires_at, t0() + Duration::days(30));
        assert_eq!(m.asset_ref, "ASA-1");
        assert!(m.is_active);
    }

    #[tokio::test]
    async fn test_verify_reports_days_and_auto_expires() {
        let ledger = ledger().await;
        ledger.purchase(&purchase("TX1", "ASA-1"), t0()).await.unwrap();

        let status = ledger.verify("FAN", "CREATOR", t0() + Duration::days(20)).await.unwrap();
        assert!(status.valid);
        assert_eq!(status.days_remaining, 10);

        let status = ledger.verify("FAN", "CREATOR", t0() + Duration::days(31)).await.unwrap();
        assert!(!status.valid);
        assert!(!ledger.find_by_event("TX1").await.unwrap().unwrap().is_active);

        let status = ledger.verify("FAN", "NOBODY", t0()).await.unwrap();
        assert!(!status.valid);
        assert!(status.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_expire_stale_batch() {
        let ledger = ledger().await;
        ledger.purchase(&purchase("TX1", "ASA-1"), t0()).await.unwrap();

        assert_eq!(ledger.expire_stale(t0() + Duration::days(29)).await.unwrap(), 0);
        assert_eq!(ledger.expire_stale(t0() + Duration::days(30)).await.unwrap(), 1);
        assert!(ledger.active_for("FAN", t0()).await.unwrap().is_empty());
    }
}
