//! Issuance service reached over HTTP.
//!
//! `POST {endpoint}/assets` mints, `POST {endpoint}/assets/{ref}/deliveries`
//! transfers. Both are retried by the pipeline, not here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{AssetSpec, Delivery, DeliveryStatus, IssuanceError, Issuer};

#[derive(Serialize)]
struct IssueRequest<'a> {
    name: &'a str,
    metadata_ref: &'a str,
}

#[derive(Deserialize)]
struct IssueResponse {
    asset_ref: String,
}

#[derive(Serialize)]
struct DeliverRequest<'a> {
    owner: &'a str,
}

#[derive(Deserialize)]
struct DeliverResponse {
    status: String,
    tx_ref: Option<String>,
}

pub struct HttpIssuer {
    client: Client,
    endpoint: String,
}

impl HttpIssuer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, IssuanceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IssuanceError::Rejected(format!("HTTP client setup failed: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn classify(err: reqwest::Error) -> IssuanceError {
        if err.is_decode() {
            IssuanceError::Rejected(err.to_string())
        } else {
            IssuanceError::Transient(err.to_string())
        }
    }

    fn status_error(status: StatusCode, body: &str) -> IssuanceError {
        let detail = format!("HTTP {} - {}", status, body.chars().take(200).collect::<String>());
        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            IssuanceError::Transient(detail)
        } else {
            IssuanceError::Rejected(detail)
        }
    }

    async fn post<Req: Serialize + Sync, Resp: DeserializeOwned>(
        &self,
        url: String,
        body: &Req,
    ) -> Result<Resp, IssuanceError> {
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::status_error(status, &body));
        }

        response.json().await.map_err(Self::classify)
    }
}

#[async_trait]
impl Issuer for HttpIssuer {
    async fn issue(&self, spec: &AssetSpec) -> Result<String, IssuanceError> {
        let response: IssueResponse = self
            .post(
                format!("{}/assets", self.endpoint),
                &IssueRequest {
                    name: &spec.name,
                    metadata_ref: &spec.metadata_ref,
                },
            )
            .await?;
        Ok(response.asset_ref)
    }

    async fn deliver(&self, asset_ref: &str, owner: &str) -> Result<Delivery, IssuanceError> {
        let response: DeliverResponse = self
            .post(
                format!("{}/assets/{}/deliveries", self.endpoint, asset_ref),
                &DeliverRequest { owner },
            )
            .await?;

        let status = DeliveryStatus::parse(&response.status).ok_or_else(|| {
            IssuanceError::Rejected(format!("unknown delivery status '{}'", response.status))
        })?;

        Ok(Delivery {
            status,
            tx_ref: response.tx_ref,
        })
    }
}
