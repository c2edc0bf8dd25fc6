//! Asset issuance: the external service that mints and delivers rewards.
//!
//! Issuance calls are slow (sign, submit, confirm). They run on
//! [`IssuancePool`], a dedicated runtime, so they never hold up polling.

mod http;
mod pool;

use std::time::Duration;

use async_trait::async_trait;

pub use http::HttpIssuer;
pub use pool::IssuancePool;

/// Longest asset name the ledger accepts.
pub const MAX_ASSET_NAME_LEN: usize = 32;

/// What to mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetSpec {
    pub name: String,
    pub metadata_ref: String,
}

impl AssetSpec {
    /// Build a spec, truncating the name to the ledger limit.
    pub fn new(name: &str, metadata_ref: &str) -> Self {
        Self {
            name: name.chars().take(MAX_ASSET_NAME_LEN).collect(),
            metadata_ref: metadata_ref.to_string(),
        }
    }
}

/// Result of handing an asset to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// Recipient has to opt in before the transfer completes.
    PendingRecipientAction,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::PendingRecipientAction => "pending_recipient_action",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "delivered" => Some(DeliveryStatus::Delivered),
            "pending_recipient_action" => Some(DeliveryStatus::PendingRecipientAction),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub status: DeliveryStatus,
    pub tx_ref: Option<String>,
}

/// Errors from the issuance boundary, typed so callers can switch on kind.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IssuanceError {
    #[error("Issuance temporarily unavailable: {0}")]
    Transient(String),

    #[error("Issuance rejected: {0}")]
    Rejected(String),

    #[error("Issuance call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Issuance worker unavailable")]
    WorkerUnavailable,
}

impl IssuanceError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, IssuanceError::Rejected(_))
    }
}

/// The external issuance service.
#[async_trait]
pub trait Issuer: Send + Sync {
    /// Mint an asset, returning its ledger reference.
    async fn issue(&self, spec: &AssetSpec) -> Result<String, IssuanceError>;

    /// Transfer an issued asset to `owner`.
    async fn deliver(&self, asset_ref: &str, owner: &str) -> Result<Delivery, IssuanceError>;
}
