//! Transferable utility tokens.
//!
//! Tokens are keyed by purchase event id. Burn and lock are terminal,
//! mutually exclusive states: both require an unburned, unlocked token owned
//! by the caller, and both are single conditional `UPDATE`s.

use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::issuance::DeliveryStatus;
use crate::storage::helpers::{format_timestamp, from_sql_int, parse_optional_timestamp, parse_timestamp, to_sql_int};
use crate::storage::schema::{Redemptions, UtilityTokens};
use crate::storage::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtilityToken {
    pub id: i64,
    pub asset_ref: String,
    pub owner: String,
    pub payee: String,
    pub purchase_event_id: String,
    pub amount_paid: u64,
    pub delivery_status: DeliveryStatus,
    pub is_burned: bool,
    pub is_locked: bool,
    pub burned_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub purchased_at: DateTime<Utc>,
}

impl UtilityToken {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("delivery_status")?;
        Ok(Self {
            id: row.try_get("id")?,
            asset_ref: row.try_get("asset_ref")?,
            owner: row.try_get("owner")?,
            payee: row.try_get("payee")?,
            purchase_event_id: row.try_get("purchase_event_id")?,
            amount_paid: from_sql_int(row.try_get("amount_paid")?),
            delivery_status: DeliveryStatus::parse(&status).ok_or(StorageError::InvalidValue {
                column: "delivery_status",
                value: status.clone(),
            })?,
            is_burned: row.try_get::<i64, _>("is_burned")? != 0,
            is_locked: row.try_get::<i64, _>("is_locked")? != 0,
            burned_at: parse_optional_timestamp(row.try_get("burned_at")?)?,
            locked_at: parse_optional_timestamp(row.try_get("locked_at")?)?,
            purchased_at: parse_timestamp(&row.try_get::<String, _>("purchased_at")?)?,
        })
    }

    /// Neither burned nor locked.
    pub fn is_spendable(&self) -> bool {
        !self.is_burned && !self.is_locked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionKind {
    Burn,
    Lock,
}

impl RedemptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionKind::Burn => "burn",
            RedemptionKind::Lock => "lock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub asset_ref: String,
    pub owner: String,
    pub kind: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A token purchase whose asset has been issued.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub event_id: String,
    pub owner: String,
    pub payee: String,
    pub amount: u64,
    pub asset_ref: String,
    pub delivery_status: DeliveryStatus,
}

/// Why a burn, lock or transfer was refused.
#[derive(Debug, thiserror::Error)]
pub enum RedemptionError {
    #[error("Token not found: {0}")]
    NotFound(String),

    #[error("Token {0} is not owned by the caller")]
    NotOwner(String),

    #[error("Token {0} is already burned")]
    AlreadyBurned(String),

    #[error("Token {0} is locked")]
    Locked(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for RedemptionError {
    fn from(err: sqlx::Error) -> Self {
        RedemptionError::Storage(StorageError::Database(err))
    }
}

fn select_all() -> SelectStatement {
    Query::select()
        .columns([
            UtilityTokens::Id,
            UtilityTokens::AssetRef,
            UtilityTokens::Owner,
            UtilityTokens::Payee,
            UtilityTokens::PurchaseEventId,
            UtilityTokens::AmountPaid,
            UtilityTokens::DeliveryStatus,
            UtilityTokens::IsBurned,
            UtilityTokens::IsLocked,
            UtilityTokens::BurnedAt,
            UtilityTokens::LockedAt,
            UtilityTokens::PurchasedAt,
        ])
        .from(UtilityTokens::Table)
        .to_owned()
}

async fn fetch_by_ref(conn: &mut SqliteConnection, asset_ref: &str) -> Result<Option<UtilityToken>> {
    let query = select_all()
        .and_where(Expr::col(UtilityTokens::AssetRef).eq(asset_ref))
        .to_string(SqliteQueryBuilder);

    let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
    row.as_ref().map(UtilityToken::from_row).transpose()
}

/// Spend a token inside the caller's transaction. Returns whether it changed.
pub(crate) async fn spend_in(
    conn: &mut SqliteConnection,
    kind: RedemptionKind,
    asset_ref: &str,
    owner: &str,
    description: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_ts = format_timestamp(now);
    let (flag, stamp) = match kind {
        RedemptionKind::Burn => (UtilityTokens::IsBurned, UtilityTokens::BurnedAt),
        RedemptionKind::Lock => (UtilityTokens::IsLocked, UtilityTokens::LockedAt),
    };

    let update = Query::update()
        .table(UtilityTokens::Table)
        .value(flag, 1)
        .value(stamp, now_ts.as_str())
        .and_where(Expr::col(UtilityTokens::AssetRef).eq(asset_ref))
        .and_where(Expr::col(UtilityTokens::Owner).eq(owner))
        .and_where(Expr::col(UtilityTokens::IsBurned).eq(0))
        .and_where(Expr::col(UtilityTokens::IsLocked).eq(0))
        .to_string(SqliteQueryBuilder);

    if sqlx::query(&update).execute(&mut *conn).await?.rows_affected() == 0 {
        return Ok(false);
    }

    let audit = Query::insert()
        .into_table(Redemptions::Table)
        .columns([
            Redemptions::AssetRef,
            Redemptions::Owner,
            Redemptions::Kind,
            Redemptions::Description,
            Redemptions::CreatedAt,
        ])
        .values_panic([
            asset_ref.into(),
            owner.into(),
            kind.as_str().into(),
            description.into(),
            now_ts.into(),
        ])
        .to_string(SqliteQueryBuilder);
    sqlx::query(&audit).execute(&mut *conn).await?;

    Ok(true)
}

/// Explain why a conditional update on `asset_ref` matched nothing.
async fn refusal(conn: &mut SqliteConnection, asset_ref: &str, owner: &str) -> RedemptionError {
    match fetch_by_ref(conn, asset_ref).await {
        Ok(None) => RedemptionError::NotFound(asset_ref.to_string()),
        Ok(Some(token)) if token.owner != owner => RedemptionError::NotOwner(asset_ref.to_string()),
        Ok(Some(token)) if token.is_burned => RedemptionError::AlreadyBurned(asset_ref.to_string()),
        Ok(Some(_)) => RedemptionError::Locked(asset_ref.to_string()),
        Err(e) => RedemptionError::Storage(e),
    }
}

#[derive(Clone)]
pub struct TokenLedger {
    pool: SqlitePool,
}

impl TokenLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_event(&self, event_id: &str) -> Result<Option<UtilityToken>> {
        let query = select_all()
            .and_where(Expr::col(UtilityTokens::PurchaseEventId).eq(event_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(UtilityToken::from_row).transpose()
    }

    pub async fn get(&self, asset_ref: &str) -> Result<Option<UtilityToken>> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_ref(&mut conn, asset_ref).await
    }

    /// Register a purchased token. Re-delivery of the same purchase event
    /// returns the existing row unchanged; the flag reports a fresh insert.
    pub async fn register_purchase(&self, new: &NewToken, now: DateTime<Utc>) -> Result<(UtilityToken, bool)> {
        let insert = Query::insert()
            .into_table(UtilityTokens::Table)
            .columns([
                UtilityTokens::AssetRef,
                UtilityTokens::Owner,
                UtilityTokens::Payee,
                UtilityTokens::PurchaseEventId,
                UtilityTokens::AmountPaid,
                UtilityTokens::DeliveryStatus,
                UtilityTokens::PurchasedAt,
            ])
            .values_panic([
                new.asset_ref.as_str().into(),
                new.owner.as_str().into(),
                new.payee.as_str().into(),
                new.event_id.as_str().into(),
                to_sql_int(new.amount).into(),
                new.delivery_status.as_str().into(),
                format_timestamp(now).into(),
            ])
            .on_conflict(OnConflict::column(UtilityTokens::PurchaseEventId).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        let created = sqlx::query(&insert).execute(&self.pool).await?.rows_affected() > 0;
        let token = self.find_by_event(&new.event_id).await?.ok_or_else(|| StorageError::MissingRow {
            table: "utility_tokens",
            key: new.event_id.clone(),
        })?;

        if created {
            info!(asset_ref = %token.asset_ref, owner = %token.owner, "Utility token registered");
        }
        Ok((token, created))
    }

    async fn spend(
        &self,
        kind: RedemptionKind,
        asset_ref: &str,
        owner: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<UtilityToken, RedemptionError> {
        let mut tx = self.pool.begin().await?;

        if !spend_in(&mut *tx, kind, asset_ref, owner, description, now).await? {
            let err = refusal(&mut *tx, asset_ref, owner).await;
            tx.rollback().await?;
            return Err(err);
        }

        let token = fetch_by_ref(&mut *tx, asset_ref)
            .await?
            .ok_or_else(|| RedemptionError::NotFound(asset_ref.to_string()))?;
        tx.commit().await?;

        info!(asset_ref = %asset_ref, owner = %owner, kind = kind.as_str(), "Utility token redeemed");
        Ok(token)
    }

    /// Consume a token for an off-chain benefit.
    pub async fn burn(
        &self,
        asset_ref: &str,
        owner: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<UtilityToken, RedemptionError> {
        self.spend(RedemptionKind::Burn, asset_ref, owner, description, now).await
    }

    /// Lock a token, e.g. as a discount applied to an order.
    pub async fn lock(
        &self,
        asset_ref: &str,
        owner: &str,
        description: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<UtilityToken, RedemptionError> {
        self.spend(RedemptionKind::Lock, asset_ref, owner, description, now).await
    }

    /// Move a spendable token to a new owner.
    pub async fn transfer(
        &self,
        asset_ref: &str,
        from: &str,
        to: &str,
    ) -> std::result::Result<UtilityToken, RedemptionError> {
        let mut tx = self.pool.begin().await?;

        let update = Query::update()
            .table(UtilityTokens::Table)
            .value(UtilityTokens::Owner, to)
            .and_where(Expr::col(UtilityTokens::AssetRef).eq(asset_ref))
            .and_where(Expr::col(UtilityTokens::Owner).eq(from))
            .and_where(Expr::col(UtilityTokens::IsBurned).eq(0))
            .and_where(Expr::col(UtilityTokens::IsLocked).eq(0))
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&update).execute(&mut *tx).await?.rows_affected() == 0 {
            let err = refusal(&mut *tx, asset_ref, from).await;
            tx.rollback().await?;
            return Err(err);
        }

        let token = fetch_by_ref(&mut *tx, asset_ref)
            .await?
            .ok_or_else(|| RedemptionError::NotFound(asset_ref.to_string()))?;
        tx.commit().await?;

        info!(asset_ref = %asset_ref, from = %from, to = %to, "Utility token transferred");
        Ok(token)
    }

    /// Whether `owner` holds a spendable `asset_ref`.
    pub async fn validate_ownership(&self, asset_ref: &str, owner: &str) -> Result<bool> {
        Ok(self
            .get(asset_ref)
            .await?
            .is_some_and(|t| t.owner == owner && t.is_spendable()))
    }

    pub async fn owned_by(&self, owner: &str, include_spent: bool) -> Result<Vec<UtilityToken>> {
        let mut query = select_all()
            .and_where(Expr::col(UtilityTokens::Owner).eq(owner))
            .order_by(UtilityTokens::Id, Order::Asc)
            .to_owned();
        if !include_spent {
            query
                .and_where(Expr::col(UtilityTokens::IsBurned).eq(0))
                .and_where(Expr::col(UtilityTokens::IsLocked).eq(0));
        }

        let rows = sqlx::query(&query.to_string(SqliteQueryBuilder))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(UtilityToken::from_row).collect()
    }

    /// Most recent redemptions first.
    pub async fn redemptions_for(&self, owner: &str, limit: u64) -> Result<Vec<Redemption>> {
        let query = Query::select()
            .columns([
                Redemptions::AssetRef,
                Redemptions::Owner,
                Redemptions::Kind,
                Redemptions::Description,
                Redemptions::CreatedAt,
            ])
            .from(Redemptions::Table)
            .and_where(Expr::col(Redemptions::Owner).eq(owner))
            .order_by(Redemptions::Id, Order::Desc)
            .limit(limit)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<Redemption> {
                Ok(Redemption {
                    asset_ref: row.try_get("asset_ref")?,
                    owner: row.try_get("owner")?,
                    kind: row.try_get("kind")?,
                    description: row.try_get("description")?,
                    created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;

    fn purchase(event_id: &str, asset_ref: &str) -> NewToken {
        NewToken {
            event_id: event_id.to_string(),
            owner: "FAN".to_string(),
            payee: "CREATOR".to_string(),
            amount: 2_000_000,
            asset_ref: asset_ref.to_string(),
            delivery_status: DeliveryStatus::PendingRecipientAction,
        }
    }

    async fn ledger_with_token() -> TokenLedger {
        let ledger = TokenLedger::new(test_pool().await);
        ledger.register_purchase(&purchase("TX1", "ASA-1"), Utc::now()).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_register_is_idempotent_on_purchase_event() {
        let ledger = TokenLedger::new(test_pool().await);

        let (first, created) = ledger.register_purchase(&purchase("TX1", "ASA-1"), Utc::now()).await.unwrap();
        assert!(created);
        assert_eq!(first.delivery_status, DeliveryStatus::PendingRecipientAction);

        let (again, created) = ledger.register_purchase(&purchase("TX1", "ASA-9"), Utc::now()).await.unwrap();
        assert!(!created);
        assert_eq!(again, first);
        assert_eq!(ledger.owned_by("FAN", true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_burn_records_redemption() {
        let ledger = ledger_with_token().await;

        let token = ledger.burn("ASA-1", "FAN", "backstage pass", Utc::now()).await.unwrap();
        assert!(token.is_burned);
        assert!(token.burned_at.is_some());

        let trail = ledger.redemptions_for("FAN", 10).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].kind, "burn");
        assert_eq!(trail[0].description, "backstage pass");
    }

    #[tokio::test]
    async fn test_burn_and_lock_are_mutually_exclusive() {
        let ledger = ledger_with_token().await;

        ledger.lock("ASA-1", "FAN", "order 7", Utc::now()).await.unwrap();
        let err = ledger.burn("ASA-1", "FAN", "again", Utc::now()).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Locked(_)));

        let ledger = ledger_with_token().await;
        ledger.burn("ASA-1", "FAN", "pass", Utc::now()).await.unwrap();
        let err = ledger.lock("ASA-1", "FAN", "order", Utc::now()).await.unwrap_err();
        assert!(matches!(err, RedemptionError::AlreadyBurned(_)));
        assert_eq!(ledger.redemptions_for("FAN", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refusals_are_diagnosed() {
        let ledger = ledger_with_token().await;

        let err = ledger.burn("ASA-404", "FAN", "x", Utc::now()).await.unwrap_err();
        assert!(matches!(err, RedemptionError::NotFound(_)));

        let err = ledger.burn("ASA-1", "THIEF", "x", Utc::now()).await.unwrap_err();
        assert!(matches!(err, RedemptionError::NotOwner(_)));
        assert!(!ledger.get("ASA-1").await.unwrap().unwrap().is_burned);
    }

    #[tokio::test]
    async fn test_transfer_only_spendable_tokens() {
        let ledger = ledger_with_token().await;

        let token = ledger.transfer("ASA-1", "FAN", "FRIEND").await.unwrap();
        assert_eq!(token.owner, "FRIEND");
        assert!(ledger.validate_ownership("ASA-1", "FRIEND").await.unwrap());
        assert!(!ledger.validate_ownership("ASA-1", "FAN").await.unwrap());

        ledger.burn("ASA-1", "FRIEND", "used", Utc::now()).await.unwrap();
        let err = ledger.transfer("ASA-1", "FRIEND", "FAN").await.unwrap_err();
        assert!(matches!(err, RedemptionError::AlreadyBurned(_)));
        assert!(!ledger.validate_ownership("ASA-1", "FRIEND").await.unwrap());
    }

    #[tokio::test]
    async fn test_owned_by_filters_spent() {
        let ledger = ledger_with_token().await;
        ledger.register_purchase(&purchase("TX2", "ASA-2"), Utc::now()).await.unwrap();
        ledger.burn("ASA-1", "FAN", "used", Utc::now()).await.unwrap();

        assert_eq!(ledger.owned_by("FAN", true).await.unwrap().len(), 2);
        let spendable = ledger.owned_by("FAN", false).await.unwrap();
        assert_eq!(spendable.len(), 1);
        assert_eq!(spendable[0].asset_ref, "ASA-2");
    }
}
