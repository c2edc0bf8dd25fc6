//! Event routing.
//!
//! Maps a decoded payment to the reward work it triggers. Memo prefixes are
//! matched case-insensitively on the trimmed memo, in priority order: order
//! settlement, membership purchase, utility token purchase, then plain tip.
//!
//! Order settlement is the one tag that does not claim the payment: when
//! `settlement_accrues_loyalty` is set the same payment is also evaluated
//! as a loyalty tip. Membership and token memos never fall through; an
//! underpaid purchase earns nothing.

use crate::config::RewardsConfig;

/// Memo classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoTag {
    /// Settlement for the given order id.
    Order(i64),
    Membership,
    UtilityToken,
    Plain,
}

/// A reward ledger path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardPath {
    Membership,
    UtilityToken,
    Loyalty,
}

impl RewardPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardPath::Membership => "membership",
            RewardPath::UtilityToken => "utility_token",
            RewardPath::Loyalty => "loyalty",
        }
    }
}

/// The primary reward decision for a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primary {
    Reward(RewardPath),
    /// The memo selected `path` but the amount does not cover it.
    BelowThreshold { path: RewardPath, required: u64 },
    /// Nothing beyond settlement applies.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Order to settle before the primary path runs.
    pub settlement: Option<i64>,
    pub primary: Primary,
}

fn strip_prefix_ignore_case<'a>(memo: &'a str, prefix: &str) -> Option<&'a str> {
    let head = memo.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        memo.get(prefix.len()..)
    } else {
        None
    }
}

/// Classify a memo. An order prefix without a numeric id is a plain memo.
pub fn classify(memo: &str, rules: &RewardsConfig) -> MemoTag {
    let memo = memo.trim();

    if let Some(rest) = strip_prefix_ignore_case(memo, &rules.order_prefix) {
        let rest = rest.trim();
        if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(order_id) = rest.parse::<i64>() {
                return MemoTag::Order(order_id);
            }
        }
        return MemoTag::Plain;
    }
    if strip_prefix_ignore_case(memo, &rules.membership_prefix).is_some() {
        return MemoTag::Membership;
    }
    if strip_prefix_ignore_case(memo, &rules.token_prefix).is_some() {
        return MemoTag::UtilityToken;
    }
    MemoTag::Plain
}

fn gate(path: RewardPath, amount: u64, required: u64) -> Primary {
    if amount >= required {
        Primary::Reward(path)
    } else {
        Primary::BelowThreshold { path, required }
    }
}

/// Decide what a payment of `amount` with `memo` should do.
pub fn route(amount: u64, memo: &str, rules: &RewardsConfig) -> Route {
    let loyalty = || gate(RewardPath::Loyalty, amount, rules.loyalty_min);

    match classify(memo, rules) {
        MemoTag::Order(order_id) => Route {
            settlement: Some(order_id),
            primary: if rules.settlement_accrues_loyalty {
                loyalty()
            } else {
                Primary::Skipped
            },
        },
        MemoTag::Membership => Route {
            settlement: None,
            primary: gate(RewardPath::Membership, amount, rules.membership_price),
        },
        MemoTag::UtilityToken => Route {
            settlement: None,
            primary: gate(RewardPath::UtilityToken, amount, rules.token_price),
        },
        MemoTag::Plain => Route {
            settlement: None,
            primary: loyalty(),
        },
    }
}
