//! Applies one payment record to the reward ledgers.
//!
//! Shared by the reconciliation loop and the retry sweeper. Every path is
//! safe to re-run for the same record: ledger writes are keyed by the
//! payment's event id, and assets are only issued when the ledger has no
//! record of them yet.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::RewardsConfig;
use crate::issuance::{AssetSpec, IssuancePool};
use crate::rewards::{NewMembership, NewToken, PurchaseOutcome, RewardError, RewardLedgers, Settlement};
use crate::router::{self, Primary, RewardPath};
use crate::storage::PaymentRecord;

/// What the primary reward path did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewardOutcome {
    Loyalty {
        tip_count: u64,
        badges_earned: u64,
        badge_ref: Option<String>,
        duplicate: bool,
    },
    Membership {
        expires_at: DateTime<Utc>,
        renewed: bool,
        duplicate: bool,
    },
    UtilityToken {
        asset_ref: String,
        duplicate: bool,
    },
    BelowThreshold {
        path: RewardPath,
        required: u64,
    },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub settlement: Option<Settlement>,
    pub outcome: RewardOutcome,
}

#[derive(Clone)]
pub struct EventProcessor {
    ledgers: RewardLedgers,
    issuance: Arc<IssuancePool>,
    rules: RewardsConfig,
}

impl EventProcessor {
    pub fn new(ledgers: RewardLedgers, issuance: Arc<IssuancePool>, rules: RewardsConfig) -> Self {
        Self {
            ledgers,
            issuance,
            rules,
        }
    }

    pub async fn apply(&self, record: &PaymentRecord) -> Result<ApplyReport, RewardError> {
        let route = router::route(record.amount, &record.memo, &self.rules);

        let settlement = match route.settlement {
            Some(order_id) => Some(self.settle(record, order_id).await?),
            None => None,
        };

        let outcome = match route.primary {
            Primary::Reward(RewardPath::Loyalty) => self.accrue_loyalty(record).await?,
            Primary::Reward(RewardPath::Membership) => self.purchase_membership(record).await?,
            Primary::Reward(RewardPath::UtilityToken) => self.purchase_token(record).await?,
            Primary::BelowThreshold { path, required } => {
                info!(
                    event_id = %record.event_id,
                    path = path.as_str(),
                    amount = record.amount,
                    required,
                    "Payment below threshold, no reward"
                );
                RewardOutcome::BelowThreshold { path, required }
            }
            Primary::Skipped => RewardOutcome::Skipped,
        };

        Ok(ApplyReport { settlement, outcome })
    }

    async fn settle(&self, record: &PaymentRecord, order_id: i64) -> Result<Settlement, RewardError> {
        let settlement = self
            .ledgers
            .orders
            .settle(
                order_id,
                &record.payer,
                &record.payee,
                record.amount,
                &record.event_id,
                Utc::now(),
            )
            .await?;

        match &settlement {
            Settlement::Settled { .. } | Settlement::AlreadySettled => {}
            other => info!(event_id = %record.event_id, order_id, outcome = ?other, "Order payment not settled"),
        }
        Ok(settlement)
    }

    async fn accrue_loyalty(&self, record: &PaymentRecord) -> Result<RewardOutcome, RewardError> {
        let tip = self
            .ledgers
            .loyalty
            .record_tip(&record.event_id, &record.payer, &record.payee, record.amount)
            .await?;

        let mut badge_ref = None;
        if let Some(number) = tip.pending_badge {
            let template = &self.rules.templates.badge;
            let spec = AssetSpec::new(&format!("{} #{number}", template.name), &template.metadata_ref);
            let (asset_ref, delivery) = self.issuance.issue_and_deliver(&spec, &record.payer).await?;

            self.ledgers
                .loyalty
                .attach_badge(&record.event_id, &record.payer, &record.payee, &asset_ref)
                .await?;
            info!(
                payer = %record.payer,
                payee = %record.payee,
                badge = number,
                asset_ref = %asset_ref,
                delivery = delivery.status.as_str(),
                "Loyalty badge issued"
            );
            badge_ref = Some(asset_ref);
        }

        Ok(RewardOutcome::Loyalty {
            tip_count: tip.record.tip_count,
            badges_earned: tip.record.badges_earned,
            badge_ref,
            duplicate: tip.duplicate,
        })
    }

    async fn purchase_membership(&self, record: &PaymentRecord) -> Result<RewardOutcome, RewardError> {
        if let Some(existing) = self.ledgers.memberships.find_by_event(&record.event_id).await? {
            debug!(event_id = %record.event_id, "Membership purchase already applied");
            return Ok(RewardOutcome::Membership {
                expires_at: existing.expires_at,
                renewed: false,
                duplicate: true,
            });
        }

        let template = &self.rules.templates.membership;
        let spec = AssetSpec::new(&template.name, &template.metadata_ref);
        let (asset_ref, delivery) = self.issuance.issue_and_deliver(&spec, &record.payer).await?;

        let outcome = self
            .ledgers
            .memberships
            .purchase(
                &NewMembership {
                    event_id: record.event_id.clone(),
                    payer: record.payer.clone(),
                    payee: record.payee.clone(),
                    amount: record.amount,
                    asset_ref,
                    delivery_status: delivery.status,
                },
                Utc::now(),
            )
            .await?;

        Ok(RewardOutcome::Membership {
            expires_at: outcome.membership().expires_at,
            renewed: matches!(outcome, PurchaseOutcome::Renewed { .. }),
            duplicate: matches!(outcome, PurchaseOutcome::Duplicate(_)),
        })
    }

    async fn purchase_token(&self, record: &PaymentRecord) -> Result<RewardOutcome, RewardError> {
        if let Some(existing) = self.ledgers.tokens.find_by_event(&record.event_id).await? {
            debug!(event_id = %record.event_id, "Token purchase already applied");
            return Ok(RewardOutcome::UtilityToken {
                asset_ref: existing.asset_ref,
                duplicate: true,
            });
        }

        let template = &self.rules.templates.token;
        let spec = AssetSpec::new(&template.name, &template.metadata_ref);
        let (asset_ref, delivery) = self.issuance.issue_and_deliver(&spec, &record.payer).await?;

        let (token, created) = self
            .ledgers
            .tokens
            .register_purchase(
                &NewToken {
                    event_id: record.event_id.clone(),
                    owner: record.payer.clone(),
                    payee: record.payee.clone(),
                    amount: record.amount,
                    asset_ref,
                    delivery_status: delivery.status,
                },
                Utc::now(),
            )
            .await?;

        Ok(RewardOutcome::UtilityToken {
            asset_ref: token.asset_ref,
            duplicate: !created,
        })
    }
}
