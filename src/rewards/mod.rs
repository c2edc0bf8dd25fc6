//! Reward ledgers.
//!
//! Each ledger owns its tables and its idempotency key: the loyalty journal,
//! the membership and token purchase event ids, and the order settlement
//! event id. Applying the same ledger event twice through any ledger is a
//! no-op the second time.

pub mod loyalty;
pub mod membership;
pub mod orders;
pub mod tokens;

pub use loyalty::{JournalEntry, LoyaltyLedger, LoyaltyRecord, TipOutcome};
pub use membership::{Membership, MembershipLedger, MembershipStatus, NewMembership, PurchaseOutcome};
pub use orders::{NewOrder, Order, OrderItem, OrderLedger, OrderStatus, Product, Settlement};
pub use tokens::{NewToken, Redemption, RedemptionError, TokenLedger, UtilityToken};

use sqlx::SqlitePool;

use crate::config::RewardsConfig;
use crate::issuance::IssuanceError;
use crate::storage::StorageError;

/// Whether a failed reward application is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Failure applying a payment to the reward ledgers.
#[derive(Debug, thiserror::Error)]
pub enum RewardError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Issuance error: {0}")]
    Issuance(#[from] IssuanceError),
}

impl RewardError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RewardError::Storage(StorageError::Database(_) | StorageError::Io(_)) => FailureKind::Transient,
            RewardError::Storage(_) => FailureKind::Permanent,
            RewardError::Issuance(e) if e.is_transient() => FailureKind::Transient,
            RewardError::Issuance(_) => FailureKind::Permanent,
        }
    }
}

/// All reward ledgers over one pool.
#[derive(Clone)]
pub struct RewardLedgers {
    pub loyalty: LoyaltyLedger,
    pub memberships: MembershipLedger,
    pub tokens: TokenLedger,
    pub orders: OrderLedger,
}

impl RewardLedgers {
    pub fn new(pool: SqlitePool, rules: &RewardsConfig) -> Self {
        Self {
            loyalty: LoyaltyLedger::new(pool.clone(), rules.badge_interval),
            memberships: MembershipLedger::new(pool.clone(), rules.membership_validity()),
            tokens: TokenLedger::new(pool.clone()),
            orders: OrderLedger::new(pool),
        }
    }
}
