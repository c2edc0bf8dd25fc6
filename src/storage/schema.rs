//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building,
//! plus the DDL applied by [`super::init_storage`].

use sea_query::Iden;

/// Singleton checkpoint row.
#[derive(Iden)]
pub enum Checkpoint {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "position"]
    Position,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Active payment sources (one ledger application per creator).
#[derive(Iden)]
pub enum PaymentSources {
    Table,
    #[iden = "source_id"]
    SourceId,
    #[iden = "payee"]
    Payee,
    #[iden = "active"]
    Active,
    #[iden = "registered_at"]
    RegisteredAt,
}

/// Decoded, deduplicated payment events.
#[derive(Iden)]
pub enum Payments {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "event_id"]
    EventId,
    #[iden = "source_id"]
    SourceId,
    #[iden = "position"]
    Position,
    #[iden = "payer"]
    Payer,
    #[iden = "payee"]
    Payee,
    #[iden = "amount"]
    Amount,
    #[iden = "memo"]
    Memo,
    #[iden = "processed"]
    Processed,
    #[iden = "attempts"]
    Attempts,
    #[iden = "abandoned"]
    Abandoned,
    #[iden = "last_error"]
    LastError,
    #[iden = "observed_at"]
    ObservedAt,
    #[iden = "claimed_at"]
    ClaimedAt,
}

/// Per (payer, payee) loyalty accrual.
#[derive(Iden)]
pub enum Loyalty {
    Table,
    #[iden = "payer"]
    Payer,
    #[iden = "payee"]
    Payee,
    #[iden = "tip_count"]
    TipCount,
    #[iden = "total_amount"]
    TotalAmount,
    #[iden = "badges_earned"]
    BadgesEarned,
    #[iden = "last_badge_ref"]
    LastBadgeRef,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Loyalty idempotency journal, one row per applied payment.
#[derive(Iden)]
pub enum LoyaltyJournal {
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "payer"]
    Payer,
    #[iden = "payee"]
    Payee,
    #[iden = "amount"]
    Amount,
    #[iden = "earned_badge"]
    EarnedBadge,
    #[iden = "badge_number"]
    BadgeNumber,
    #[iden = "badge_ref"]
    BadgeRef,
    #[iden = "created_at"]
    CreatedAt,
}

/// Time-bound memberships.
#[derive(Iden)]
pub enum Memberships {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "payer"]
    Payer,
    #[iden = "payee"]
    Payee,
    #[iden = "asset_ref"]
    AssetRef,
    #[iden = "delivery_status"]
    DeliveryStatus,
    #[iden = "purchased_at"]
    PurchasedAt,
    #[iden = "expires_at"]
    ExpiresAt,
    #[iden = "is_active"]
    IsActive,
    #[iden = "purchase_event_id"]
    PurchaseEventId,
    #[iden = "amount_paid"]
    AmountPaid,
}

/// Transferable utility tokens.
#[derive(Iden)]
pub enum UtilityTokens {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "asset_ref"]
    AssetRef,
    #[iden = "owner"]
    Owner,
    #[iden = "payee"]
    Payee,
    #[iden = "purchase_event_id"]
    PurchaseEventId,
    #[iden = "amount_paid"]
    AmountPaid,
    #[iden = "delivery_status"]
    DeliveryStatus,
    #[iden = "is_burned"]
    IsBurned,
    #[iden = "is_locked"]
    IsLocked,
    #[iden = "burned_at"]
    BurnedAt,
    #[iden = "locked_at"]
    LockedAt,
    #[iden = "purchased_at"]
    PurchasedAt,
}

/// Burn/lock audit trail for utility tokens.
#[derive(Iden)]
pub enum Redemptions {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "asset_ref"]
    AssetRef,
    #[iden = "owner"]
    Owner,
    #[iden = "kind"]
    Kind,
    #[iden = "description"]
    Description,
    #[iden = "created_at"]
    CreatedAt,
}

/// Merchandise catalog rows touched by settlement.
#[derive(Iden)]
pub enum Products {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "payee"]
    Payee,
    #[iden = "name"]
    Name,
    #[iden = "stock_quantity"]
    StockQuantity,
}

/// Commerce orders.
#[derive(Iden)]
pub enum Orders {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "payer"]
    Payer,
    #[iden = "payee"]
    Payee,
    #[iden = "status"]
    Status,
    #[iden = "total_amount"]
    TotalAmount,
    #[iden = "token_refs"]
    TokenRefs,
    #[iden = "settlement_event_id"]
    SettlementEventId,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "paid_at"]
    PaidAt,
}

/// Order line items.
#[derive(Iden)]
pub enum OrderItems {
    Table,
    #[iden = "order_id"]
    OrderId,
    #[iden = "product_id"]
    ProductId,
    #[iden = "quantity"]
    Quantity,
}

/// SQL for creating the checkpoint table.
pub const CREATE_CHECKPOINT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoint (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    position INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQL for creating the payment source registry.
pub const CREATE_PAYMENT_SOURCES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS payment_sources (
    source_id TEXT PRIMARY KEY,
    payee TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    registered_at TEXT NOT NULL
);
"#;

/// SQL for creating the payments table.
pub const CREATE_PAYMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS payments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    source_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    payer TEXT NOT NULL,
    payee TEXT NOT NULL,
    amount INTEGER NOT NULL,
    memo TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    abandoned INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    observed_at TEXT NOT NULL,
    claimed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_payments_unprocessed ON payments(processed, id);
"#;

/// SQL for creating the loyalty ledger and its journal.
pub const CREATE_LOYALTY_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS loyalty (
    payer TEXT NOT NULL,
    payee TEXT NOT NULL,
    tip_count INTEGER NOT NULL DEFAULT 0,
    total_amount INTEGER NOT NULL DEFAULT 0,
    badges_earned INTEGER NOT NULL DEFAULT 0,
    last_badge_ref TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (payer, payee)
);

CREATE TABLE IF NOT EXISTS loyalty_journal (
    event_id TEXT PRIMARY KEY,
    payer TEXT NOT NULL,
    payee TEXT NOT NULL,
    amount INTEGER NOT NULL,
    earned_badge INTEGER NOT NULL DEFAULT 0,
    badge_number INTEGER,
    badge_ref TEXT,
    created_at TEXT NOT NULL
);
"#;

/// SQL for creating the memberships table.
pub const CREATE_MEMBERSHIPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS memberships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payer TEXT NOT NULL,
    payee TEXT NOT NULL,
    asset_ref TEXT NOT NULL UNIQUE,
    delivery_status TEXT NOT NULL,
    purchased_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    purchase_event_id TEXT NOT NULL UNIQUE,
    amount_paid INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_memberships_one_active
    ON memberships(payer, payee) WHERE is_active = 1;
CREATE INDEX IF NOT EXISTS idx_memberships_expiry ON memberships(is_active, expires_at);
"#;

/// SQL for creating utility tokens and the redemption trail.
pub const CREATE_TOKEN_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS utility_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_ref TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    payee TEXT NOT NULL,
    purchase_event_id TEXT NOT NULL UNIQUE,
    amount_paid INTEGER NOT NULL,
    delivery_status TEXT NOT NULL,
    is_burned INTEGER NOT NULL DEFAULT 0,
    is_locked INTEGER NOT NULL DEFAULT 0,
    burned_at TEXT,
    locked_at TEXT,
    purchased_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_utility_tokens_owner ON utility_tokens(owner);

CREATE TABLE IF NOT EXISTS redemptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_ref TEXT NOT NULL,
    owner TEXT NOT NULL,
    kind TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// SQL for creating the commerce tables touched by settlement.
pub const CREATE_ORDER_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payee TEXT NOT NULL,
    name TEXT NOT NULL,
    stock_quantity INTEGER
);

CREATE TABLE IF NOT EXISTS orders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payer TEXT NOT NULL,
    payee TEXT NOT NULL,
    status TEXT NOT NULL,
    total_amount INTEGER NOT NULL,
    token_refs TEXT NOT NULL DEFAULT '[]',
    settlement_event_id TEXT UNIQUE,
    created_at TEXT NOT NULL,
    paid_at TEXT
);

CREATE TABLE IF NOT EXISTS order_items (
    order_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    quantity INTEGER NOT NULL,
    PRIMARY KEY (order_id, product_id)
);
"#;

/// All DDL in dependency order.
pub const ALL_TABLES: &[&str] = &[
    CREATE_CHECKPOINT_TABLE,
    CREATE_PAYMENT_SOURCES_TABLE,
    CREATE_PAYMENTS_TABLE,
    CREATE_LOYALTY_TABLES,
    CREATE_MEMBERSHIPS_TABLE,
    CREATE_TOKEN_TABLES,
    CREATE_ORDER_TABLES,
];
