//! Upstream device-registry lookup
//!
//! The handshake enriches every connect with metadata from the "liberator"
//! service. The fetch sits behind a trait so tests and deployments without
//! the service can substitute their own source.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("unexpected response for device {device}: status {status}: {detail}")]
    UnexpectedStatus {
        device: String,
        status: u16,
        detail: String,
    },
}

/// Source of per-device metadata consulted during the CONNECT handshake.
/// A failed fetch is fatal to the handshake.
#[async_trait]
pub trait DeviceInfoFetcher: Send + Sync + 'static {
    async fn fetch(&self, device_name: &str) -> Result<Map<String, Value>, FetchError>;
}

/// HTTP client for `GET {base}/v2/devices/{name}` with bearer auth.
pub struct LiberatorClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl LiberatorClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DeviceInfoFetcher for LiberatorClient {
    async fn fetch(&self, device_name: &str) -> Result<Map<String, Value>, FetchError> {
        let url = format!("{}/v2/devices/{}", self.base_url, device_name);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        let info: Map<String, Value> = response.json().await?;

        if status.as_u16() != 200 {
            let detail = info
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(FetchError::UnexpectedStatus {
                device: device_name.to_string(),
                status: status.as_u16(),
                detail,
            });
        }

        Ok(info)
    }
}
