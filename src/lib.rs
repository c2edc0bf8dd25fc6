//! tipsync - ledger payment reconciliation
//!
//! Watches a public ledger for creator tips and purchases and turns them
//! into off-chain rewards: loyalty badges, memberships, utility tokens and
//! settled merchandise orders. The ledger is append-only and out of our
//! control; reward state lives in SQLite. Every mutation is keyed by the
//! ledger event id so the pipeline can be restarted and replayed freely.

pub mod config;
pub mod issuance;
pub mod ledger;
pub mod pipeline;
pub mod rewards;
pub mod router;
pub mod storage;
pub mod utils;
