//! Merchandise orders settled by ledger payments.
//!
//! An order moves PENDING_PAYMENT -> PAID at most once. The transition is a
//! conditional `UPDATE` that also records the settlement event id, so a
//! second observation of the same payment matches nothing and stock and
//! token locks are never reapplied.

use chrono::{DateTime, Utc};
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use super::tokens::{spend_in, RedemptionKind};
use crate::storage::helpers::{format_timestamp, from_sql_int, parse_optional_timestamp, parse_timestamp, to_sql_int};
use crate::storage::schema::{OrderItems, Orders, Products};
use crate::storage::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING_PAYMENT" => Some(OrderStatus::PendingPayment),
            "PAID" => Some(OrderStatus::Paid),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: i64,
    pub payee: String,
    pub name: String,
    /// `None` means unlimited stock.
    pub stock_quantity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub product_id: i64,
    pub quantity: u64,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub payer: String,
    pub payee: String,
    pub items: Vec<OrderItem>,
    pub total_amount: u64,
    /// Utility tokens applied as a discount, locked on settlement.
    pub token_refs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub id: i64,
    pub payer: String,
    pub payee: String,
    pub status: OrderStatus,
    pub total_amount: u64,
    pub token_refs: Vec<String>,
    pub settlement_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Order {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let token_refs: String = row.try_get("token_refs")?;
        Ok(Self {
            id: row.try_get("id")?,
            payer: row.try_get("payer")?,
            payee: row.try_get("payee")?,
            status: OrderStatus::parse(&status).ok_or(StorageError::InvalidValue {
                column: "status",
                value: status.clone(),
            })?,
            total_amount: from_sql_int(row.try_get("total_amount")?),
            token_refs: serde_json::from_str(&token_refs).map_err(|_| StorageError::InvalidValue {
                column: "token_refs",
                value: token_refs.clone(),
            })?,
            settlement_event_id: row.try_get("settlement_event_id")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            paid_at: parse_optional_timestamp(row.try_get("paid_at")?)?,
        })
    }
}

/// Result of applying a settlement payment to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Settled { order_id: i64, tokens_locked: usize },
    /// This event already settled the order.
    AlreadySettled,
    /// No order with that id between this payer and payee.
    NotFound,
    Underpaid { required: u64 },
    NotPending { status: OrderStatus },
}

async fn fetch_order(conn: &mut SqliteConnection, order_id: i64) -> Result<Option<Order>> {
    let query = Query::select()
        .columns([
            Orders::Id,
            Orders::Payer,
            Orders::Payee,
            Orders::Status,
            Orders::TotalAmount,
            Orders::TokenRefs,
            Orders::SettlementEventId,
            Orders::CreatedAt,
            Orders::PaidAt,
        ])
        .from(Orders::Table)
        .and_where(Expr::col(Orders::Id).eq(order_id))
        .to_string(SqliteQueryBuilder);

    let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
    row.as_ref().map(Order::from_row).transpose()
}

async fn fetch_items(conn: &mut SqliteConnection, order_id: i64) -> Result<Vec<OrderItem>> {
    let query = Query::select()
        .columns([OrderItems::ProductId, OrderItems::Quantity])
        .from(OrderItems::Table)
        .and_where(Expr::col(OrderItems::OrderId).eq(order_id))
        .to_string(SqliteQueryBuilder);

    let rows = sqlx::query(&query).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| -> Result<OrderItem> {
            Ok(OrderItem {
                product_id: row.try_get("product_id")?,
                quantity: from_sql_int(row.try_get("quantity")?),
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct OrderLedger {
    pool: SqlitePool,
}

impl OrderLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_product(&self, payee: &str, name: &str, stock: Option<u64>) -> Result<Product> {
        let query = Query::insert()
            .into_table(Products::Table)
            .columns([Products::Payee, Products::Name, Products::StockQuantity])
            .values_panic([payee.into(), name.into(), stock.map(to_sql_int).into()])
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(Product {
            id: result.last_insert_rowid(),
            payee: payee.to_string(),
            name: name.to_string(),
            stock_quantity: stock,
        })
    }

    pub async fn product(&self, id: i64) -> Result<Option<Product>> {
        let query = Query::select()
            .columns([Products::Id, Products::Payee, Products::Name, Products::StockQuantity])
            .from(Products::Table)
            .and_where(Expr::col(Products::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        Ok(Some(Product {
            id: row.try_get("id")?,
            payee: row.try_get("payee")?,
            name: row.try_get("name")?,
            stock_quantity: row.try_get::<Option<i64>, _>("stock_quantity")?.map(from_sql_int),
        }))
    }

    /// Place an order awaiting its ledger payment.
    pub async fn create_pending(&self, new: &NewOrder, now: DateTime<Utc>) -> Result<Order> {
        let token_refs = serde_json::to_string(&new.token_refs).map_err(|e| StorageError::InvalidValue {
            column: "token_refs",
            value: e.to_string(),
        })?;
        let mut tx = self.pool.begin().await?;

        let insert = Query::insert()
            .into_table(Orders::Table)
            .columns([
                Orders::Payer,
                Orders::Payee,
                Orders::Status,
                Orders::TotalAmount,
                Orders::TokenRefs,
                Orders::CreatedAt,
            ])
            .values_panic([
                new.payer.as_str().into(),
                new.payee.as_str().into(),
                OrderStatus::PendingPayment.as_str().into(),
                to_sql_int(new.total_amount).into(),
                token_refs.into(),
                format_timestamp(now).into(),
            ])
            .to_string(SqliteQueryBuilder);
        let order_id = sqlx::query(&insert).execute(&mut *tx).await?.last_insert_rowid();

        for item in &new.items {
            let insert = Query::insert()
                .into_table(OrderItems::Table)
                .columns([OrderItems::OrderId, OrderItems::ProductId, OrderItems::Quantity])
                .values_panic([order_id.into(), item.product_id.into(), to_sql_int(item.quantity).into()])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&insert).execute(&mut *tx).await?;
        }

        let order = fetch_order(&mut *tx, order_id).await?.ok_or_else(|| StorageError::MissingRow {
            table: "orders",
            key: order_id.to_string(),
        })?;
        tx.commit().await?;

        debug!(order_id, payer = %new.payer, total = new.total_amount, "Order created");
        Ok(order)
    }

    pub async fn get(&self, order_id: i64) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        fetch_order(&mut conn, order_id).await
    }

    pub async fn items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        let mut conn = self.pool.acquire().await?;
        fetch_items(&mut conn, order_id).await
    }

    /// Cancel a pending order. Returns whether it was pending.
    pub async fn cancel(&self, order_id: i64) -> Result<bool> {
        let query = Query::update()
            .table(Orders::Table)
            .value(Orders::Status, OrderStatus::Cancelled.as_str())
            .and_where(Expr::col(Orders::Id).eq(order_id))
            .and_where(Expr::col(Orders::Status).eq(OrderStatus::PendingPayment.as_str()))
            .to_string(SqliteQueryBuilder);

        Ok(sqlx::query(&query).execute(&self.pool).await?.rows_affected() > 0)
    }

    /// Apply a payment tagged for `order_id`.
    ///
    /// Only a pending order between the same payer and payee whose total is
    /// covered by `amount` is settled. Stock is decremented where tracked and
    /// sufficient, and any discount tokens are locked, all in one transaction.
    pub async fn settle(
        &self,
        order_id: i64,
        payer: &str,
        payee: &str,
        amount: u64,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Settlement> {
        let now_ts = format_timestamp(now);
        let mut tx = self.pool.begin().await?;

        let update = Query::update()
            .table(Orders::Table)
            .value(Orders::Status, OrderStatus::Paid.as_str())
            .value(Orders::SettlementEventId, event_id)
            .value(Orders::PaidAt, now_ts.as_str())
            .and_where(Expr::col(Orders::Id).eq(order_id))
            .and_where(Expr::col(Orders::Payer).eq(payer))
            .and_where(Expr::col(Orders::Payee).eq(payee))
            .and_where(Expr::col(Orders::Status).eq(OrderStatus::PendingPayment.as_str()))
            .and_where(Expr::col(Orders::TotalAmount).lte(to_sql_int(amount)))
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&update).execute(&mut *tx).await?.rows_affected() == 0 {
            let order = fetch_order(&mut *tx, order_id).await?;
            tx.rollback().await?;

            let outcome = match order {
                Some(o) if o.payer == payer && o.payee == payee => {
                    if o.settlement_event_id.as_deref() == Some(event_id) {
                        Settlement::AlreadySettled
                    } else if o.status != OrderStatus::PendingPayment {
                        Settlement::NotPending { status: o.status }
                    } else {
                        Settlement::Underpaid {
                            required: o.total_amount,
                        }
                    }
                }
                _ => Settlement::NotFound,
            };
            debug!(order_id, event_id = %event_id, ?outcome, "Settlement not applied");
            return Ok(outcome);
        }

        for item in fetch_items(&mut *tx, order_id).await? {
            let quantity = to_sql_int(item.quantity);
            let decrement = Query::update()
                .table(Products::Table)
                .value(Products::StockQuantity, Expr::col(Products::StockQuantity).sub(quantity))
                .and_where(Expr::col(Products::Id).eq(item.product_id))
                .and_where(Expr::col(Products::StockQuantity).is_not_null())
                .and_where(Expr::col(Products::StockQuantity).gte(quantity))
                .to_string(SqliteQueryBuilder);
            sqlx::query(&decrement).execute(&mut *tx).await?;
        }

        let order = fetch_order(&mut *tx, order_id).await?.ok_or_else(|| StorageError::MissingRow {
            table: "orders",
            key: order_id.to_string(),
        })?;

        let description = format!("Discount for order {order_id}");
        let mut tokens_locked = 0;
        for asset_ref in &order.token_refs {
            if spend_in(&mut *tx, RedemptionKind::Lock, asset_ref, payer, &description, now).await? {
                tokens_locked += 1;
            } else {
                warn!(order_id, asset_ref = %asset_ref, "Discount token not lockable");
            }
        }

        tx.commit().await?;
        info!(order_id, event_id = %event_id, tokens_locked, "Order settled");
        Ok(Settlement::Settled {
            order_id,
            tokens_locked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::DeliveryStatus;
    use crate::rewards::tokens::{NewToken, TokenLedger};
    use crate::storage::test_pool;

    async fn setup() -> (OrderLedger, Order, Product) {
        let ledger = OrderLedger::new(test_pool().await);
        let product = ledger.create_product("CREATOR", "Hoodie", Some(3)).await.unwrap();
        let order = ledger
            .create_pending(
                &NewOrder {
                    payer: "FAN".to_string(),
                    payee: "CREATOR".to_string(),
                    items: vec![OrderItem {
                        product_id: product.id,
                        quantity: 2,
                    }],
                    total_amount: 10_000_000,
                    token_refs: vec![],
                },
                Utc::now(),
            )
            .await
            .unwrap();
        (ledger, order, product)
    }

    #[tokio::test]
    async fn test_settle_marks_paid_and_decrements_stock() {
        let (ledger, order, product) = setup().await;

        let outcome = ledger
            .settle(order.id, "FAN", "CREATOR", 10_000_000, "TX1", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Settlement::Settled {
                order_id: order.id,
                tokens_locked: 0
            }
        );

        let paid = ledger.get(order.id).await.unwrap().unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(paid.settlement_event_id.as_deref(), Some("TX1"));
        assert!(paid.paid_at.is_some());
        assert_eq!(ledger.product(product.id).await.unwrap().unwrap().stock_quantity, Some(1));
    }

    #[tokio::test]
    async fn test_second_settlement_is_noop() {
        let (ledger, order, product) = setup().await;
        ledger
            .settle(order.id, "FAN", "CREATOR", 10_000_000, "TX1", Utc::now())
            .await
            .unwrap();

        let again = ledger
            .settle(order.id, "FAN", "CREATOR", 10_000_000, "TX1", Utc::now())
            .await
            .unwrap();
        assert_eq!(again, Settlement::AlreadySettled);

        let other = ledger
            .settle(order.id, "FAN", "CREATOR", 10_000_000, "TX2", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            other,
            Settlement::NotPending {
                status: OrderStatus::Paid
            }
        );
        assert_eq!(ledger.product(product.id).await.unwrap().unwrap().stock_quantity, Some(1));
    }

    #[tokio::test]
    async fn test_underpayment_leaves_order_pending() {
        let (ledger, order, _) = setup().await;

        let outcome = ledger
            .settle(order.id, "FAN", "CREATOR", 9_999_999, "TX1", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, Settlement::Underpaid { required: 10_000_000 });
        assert_eq!(
            ledger.get(order.id).await.unwrap().unwrap().status,
            OrderStatus::PendingPayment
        );
    }

    #[tokio::test]
    async fn test_wrong_parties_or_missing_order_not_found() {
        let (ledger, order, _) = setup().await;

        let outcome = ledger
            .settle(order.id, "STRANGER", "CREATOR", 10_000_000, "TX1", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, Settlement::NotFound);

        let outcome = ledger
            .settle(9999, "FAN", "CREATOR", 10_000_000, "TX1", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, Settlement::NotFound);
    }

    #[tokio::test]
    async fn test_cancelled_order_is_not_settled() {
        let (ledger, order, _) = setup().await;
        assert!(ledger.cancel(order.id).await.unwrap());
        assert!(!ledger.cancel(order.id).await.unwrap());

        let outcome = ledger
            .settle(order.id, "FAN", "CREATOR", 10_000_000, "TX1", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Settlement::NotPending {
                status: OrderStatus::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn test_untracked_and_short_stock_untouched() {
        let ledger = OrderLedger::new(test_pool().await);
        let unlimited = ledger.create_product("CREATOR", "Sticker", None).await.unwrap();
        let scarce = ledger.create_product("CREATOR", "Print", Some(1)).await.unwrap();
        let order = ledger
            .create_pending(
                &NewOrder {
                    payer: "FAN".to_string(),
                    payee: "CREATOR".to_string(),
                    items: vec![
                        OrderItem {
                            product_id: unlimited.id,
                            quantity: 4,
                        },
                        OrderItem {
                            product_id: scarce.id,
                            quantity: 2,
                        },
                    ],
                    total_amount: 1_000_000,
                    token_refs: vec![],
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(ledger.items(order.id).await.unwrap().len(), 2);

        ledger
            .settle(order.id, "FAN", "CREATOR", 1_000_000, "TX1", Utc::now())
            .await
            .unwrap();
        assert_eq!(ledger.product(unlimited.id).await.unwrap().unwrap().stock_quantity, None);
        assert_eq!(ledger.product(scarce.id).await.unwrap().unwrap().stock_quantity, Some(1));
    }

    #[tokio::test]
    async fn test_settlement_locks_discount_tokens() {
        let pool = test_pool().await;
        let tokens = TokenLedger::new(pool.clone());
        let ledger = OrderLedger::new(pool);

        tokens
            .register_purchase(
                &NewToken {
                    event_id: "BUY1".to_string(),
                    owner: "FAN".to_string(),
                    payee: "CREATOR".to_string(),
                    amount: 2_000_000,
                    asset_ref: "ASA-7".to_string(),
                    delivery_status: DeliveryStatus::Delivered,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let order = ledger
            .create_pending(
                &NewOrder {
                    payer: "FAN".to_string(),
                    payee: "CREATOR".to_string(),
                    items: vec![],
                    total_amount: 500_000,
                    token_refs: vec!["ASA-7".to_string(), "ASA-MISSING".to_string()],
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(order.token_refs.len(), 2);

        let outcome = ledger
            .settle(order.id, "FAN", "CREATOR", 500_000, "TX1", Utc::now())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Settlement::Settled {
                order_id: order.id,
                tokens_locked: 1
            }
        );

        let token = tokens.get("ASA-7").await.unwrap().unwrap();
        assert!(token.is_locked);
        let trail = tokens.redemptions_for("FAN", 10).await.unwrap();
        assert_eq!(trail[0].description, format!("Discount for order {}", order.id));
    }
}
