//! Reward routing thresholds and asset templates.

use serde::Deserialize;

/// Name and metadata used when asking the issuance service for an asset.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetTemplate {
    pub name: String,
    pub metadata_ref: String,
}

impl AssetTemplate {
    fn new(name: &str, metadata_ref: &str) -> Self {
        Self {
            name: name.to_string(),
            metadata_ref: metadata_ref.to_string(),
        }
    }
}

/// Issuance templates per reward kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub badge: AssetTemplate,
    pub membership: AssetTemplate,
    pub token: AssetTemplate,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            badge: AssetTemplate::new("Loyalty Badge", "ipfs://tipsync/badge.json"),
            membership: AssetTemplate::new("Creator Membership", "ipfs://tipsync/membership.json"),
            token: AssetTemplate::new("Creator Token", "ipfs://tipsync/token.json"),
        }
    }
}

/// Memo prefixes, prices (ledger base units) and reward parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RewardsConfig {
    /// Order settlement memo prefix, followed by the numeric order id.
    pub order_prefix: String,
    /// Membership purchase memo prefix.
    pub membership_prefix: String,
    /// Utility token purchase memo prefix.
    pub token_prefix: String,
    pub membership_price: u64,
    pub token_price: u64,
    /// Smallest plain tip that counts toward loyalty.
    pub loyalty_min: u64,
    /// A badge is earned on every n-th qualifying tip.
    pub badge_interval: u64,
    pub membership_validity_days: u32,
    /// Whether an order payment also counts as a loyalty tip.
    pub settlement_accrues_loyalty: bool,
    pub templates: TemplateConfig,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            order_prefix: "ORDER:".to_string(),
            membership_prefix: "MEMBERSHIP:BAUNI".to_string(),
            token_prefix: "PURCHASE:SHAWTY".to_string(),
            membership_price: 5_000_000,
            token_price: 2_000_000,
            loyalty_min: 500_000,
            badge_interval: 5,
            membership_validity_days: 30,
            settlement_accrues_loyalty: true,
            templates: TemplateConfig::default(),
        }
    }
}

impl RewardsConfig {
    pub fn membership_validity(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.membership_validity_days))
    }
}
