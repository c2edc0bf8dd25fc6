//! HTTP client for the ledger indexer's transaction search endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{LedgerError, LedgerIndexer, RawEvent, SearchPage};

#[derive(Debug, Deserialize)]
struct TransactionsResponse {
    #[serde(default)]
    transactions: Vec<Transaction>,
    #[serde(rename = "next-token")]
    next_token: Option<String>,
    #[serde(rename = "current-round")]
    current_round: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Transaction {
    id: Option<String>,
    #[serde(rename = "confirmed-round")]
    confirmed_round: Option<u64>,
    #[serde(default)]
    logs: Vec<String>,
}

impl From<TransactionsResponse> for SearchPage {
    fn from(response: TransactionsResponse) -> Self {
        let events = response
            .transactions
            .into_iter()
            .filter_map(|txn| {
                let id = txn.id?;
                Some(RawEvent {
                    id,
                    position: txn.confirmed_round.unwrap_or(0),
                    payload: txn.logs.into_iter().next(),
                })
            })
            .collect();

        SearchPage {
            events,
            next: response.next_token.filter(|t| !t.is_empty()),
            head: response.current_round,
        }
    }
}

/// Indexer reached over HTTP.
pub struct HttpIndexer {
    client: Client,
    base_url: String,
}

impl HttpIndexer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Rejected(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn classify(err: reqwest::Error) -> LedgerError {
        if err.is_timeout() {
            LedgerError::Timeout(err.to_string())
        } else if err.is_connect() {
            LedgerError::Connect(err.to_string())
        } else if err.is_decode() {
            LedgerError::Decode(err.to_string())
        } else {
            LedgerError::Unavailable(err.to_string())
        }
    }

    /// Retry 429 (rate limit) and 5xx (server errors).
    fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

#[async_trait]
impl LedgerIndexer for HttpIndexer {
    async fn search(
        &self,
        source_id: &str,
        min_position: u64,
        continuation: Option<&str>,
    ) -> Result<SearchPage, LedgerError> {
        let url = format!("{}/v2/transactions", self.base_url);
        let min_round = min_position.to_string();
        let mut params = vec![
            ("application-id", source_id),
            ("tx-type", "appl"),
            ("min-round", min_round.as_str()),
        ];
        if let Some(token) = continuation {
            params.push(("next", token));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {} - {}", status, body.chars().take(200).collect::<String>());
            warn!(source_id = %source_id, status = %status, "Indexer search failed");
            return Err(if Self::is_retryable_status(status) {
                LedgerError::Unavailable(detail)
            } else {
                LedgerError::Rejected(detail)
            });
        }

        let body: TransactionsResponse = response.json().await.map_err(Self::classify)?;
        let page = SearchPage::from(body);
        debug!(
            source_id = %source_id,
            min_position,
            events = page.events.len(),
            has_next = page.next.is_some(),
            "Indexer page fetched"
        );
        Ok(page)
    }
}
