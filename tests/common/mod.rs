//! Shared utilities for integration tests.
//!
//! Provides a scripted ledger indexer, a failure-injecting issuer and
//! builders for encoded payment events.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use tipsync::config::Config;
use tipsync::issuance::{AssetSpec, Delivery, DeliveryStatus, IssuanceError, Issuer};
use tipsync::ledger::decoder::encode_address;
use tipsync::ledger::{LedgerError, LedgerIndexer, RawEvent, SearchPage};
use tipsync::pipeline::{Pipeline, PipelineStatus};
use tipsync::storage::init_storage;

pub const SOURCE: &str = "APP-1";
pub const CREATOR: &str = "CREATOR-ADDR";

/// Public key for test payer `n`.
pub fn payer_key(n: u8) -> [u8; 32] {
    [n; 32]
}

/// Ledger address of test payer `n`, as the decoder renders it.
pub fn payer(n: u8) -> String {
    encode_address(&payer_key(n))
}

/// A payment log event from payer `n`.
pub fn payment(id: &str, position: u64, from: u8, amount: u64, memo: &str) -> RawEvent {
    let mut bytes = payer_key(from).to_vec();
    bytes.extend_from_slice(&amount.to_be_bytes());
    bytes.extend_from_slice(memo.as_bytes());
    RawEvent {
        id: id.to_string(),
        position,
        payload: Some(STANDARD.encode(bytes)),
    }
}

/// An application call that is not a payment.
pub fn non_payment(id: &str, position: u64) -> RawEvent {
    RawEvent {
        id: id.to_string(),
        position,
        payload: Some(STANDARD.encode(b"opt-in")),
    }
}

/// In-memory indexer serving scripted events in fixed-size pages.
///
/// Continuation tokens are offsets into the filtered event list, so the
/// same event pushed twice shows up on two pages.
pub struct ScriptedIndexer {
    events: Mutex<HashMap<String, Vec<RawEvent>>>,
    failures: Mutex<HashMap<String, VecDeque<LedgerError>>>,
    page_size: usize,
    calls: AtomicUsize,
}

impl ScriptedIndexer {
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, source_id: &str, event: RawEvent) {
        self.events
            .lock()
            .unwrap()
            .entry(source_id.to_string())
            .or_default()
            .push(event);
    }

    /// Fail the next query for `source_id` with `err`.
    pub fn fail_next(&self, source_id: &str, err: LedgerError) {
        self.failures
            .lock()
            .unwrap()
            .entry(source_id.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerIndexer for ScriptedIndexer {
    async fn search(
        &self,
        source_id: &str,
        min_position: u64,
        continuation: Option<&str>,
    ) -> Result<SearchPage, LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(source_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let events = self.events.lock().unwrap();
        let head = events.values().flatten().map(|e| e.position).max();
        let mut matching: Vec<RawEvent> = events
            .get(source_id)
            .map(|all| all.iter().filter(|e| e.position >= min_position).cloned().collect())
            .unwrap_or_default();
        matching.sort_by_key(|e| e.position);

        let offset: usize = continuation.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (offset + self.page_size).min(matching.len());
        let page = matching.get(offset..end).map(<[RawEvent]>::to_vec).unwrap_or_default();

        Ok(SearchPage {
            events: page,
            next: (end < matching.len()).then(|| end.to_string()),
            head,
        })
    }
}

/// Issuer that mints sequential refs, fails on demand and can be slowed.
#[derive(Default)]
pub struct MockIssuer {
    issued: AtomicUsize,
    failure: Mutex<Option<IssuanceError>>,
    delay: Mutex<Duration>,
}

impl MockIssuer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every `issue` call with `err` until cleared with `None`.
    pub fn fail_with(&self, err: Option<IssuanceError>) {
        *self.failure.lock().unwrap() = err;
    }

    /// Hold every `issue` call for `delay` before it completes.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Issuer for MockIssuer {
    async fn issue(&self, _spec: &AssetSpec) -> Result<String, IssuanceError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("ASA-{n}"))
    }

    async fn deliver(&self, asset_ref: &str, _owner: &str) -> Result<Delivery, IssuanceError> {
        Ok(Delivery {
            status: DeliveryStatus::Delivered,
            tx_ref: Some(format!("XFER-{asset_ref}")),
        })
    }
}

/// A pipeline over in-memory storage with one registered source.
pub struct Harness {
    pub pipeline: Pipeline,
    pub indexer: Arc<ScriptedIndexer>,
    pub issuer: Arc<MockIssuer>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Config::for_test()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let indexer = ScriptedIndexer::new(100);
        let issuer = MockIssuer::new();
        let pipeline = open_pipeline(config, indexer.clone(), issuer.clone()).await;
        pipeline.sources().register(SOURCE, CREATOR).await.unwrap();
        Self {
            pipeline,
            indexer,
            issuer,
        }
    }

    pub fn push(&self, event: RawEvent) {
        self.indexer.push(SOURCE, event);
    }
}

pub async fn open_pipeline(config: Config, indexer: Arc<ScriptedIndexer>, issuer: Arc<MockIssuer>) -> Pipeline {
    let pool = init_storage(&config.storage).await.unwrap();
    Pipeline::new(pool, indexer, issuer, config).unwrap()
}

/// Test config backed by a SQLite file under `dir`.
pub fn file_config(dir: &Path) -> Config {
    let mut config = Config::for_test();
    config.storage.path = dir.join("tipsync.db").to_string_lossy().into_owned();
    config.storage.max_connections = 4;
    config
}

/// Poll `status` until `done` holds, or panic after two seconds.
pub async fn wait_for(status: impl Fn() -> PipelineStatus, done: impl Fn(&PipelineStatus) -> bool) -> PipelineStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = status();
        if done(&current) {
            return current;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached, last status: {current:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
