use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::contract::Envelope;
use crate::reliability::retry::{is_retryable_http_error, is_retryable_network_error};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct TransportError {
    pub reason: String,
    /// Whether a later attempt might succeed.
    pub retryable: bool,
}

impl TransportError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Request-style fallback transport: one call per envelope, bounded by `timeout`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, address: &str, envelope: &Envelope, timeout: Duration) -> Result<(), TransportError>;
}

/// POSTs the envelope as JSON to the component's `http` endpoint.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, address: &str, envelope: &Envelope, timeout: Duration) -> Result<(), TransportError> {
        let resp = self
            .client
            .post(address)
            .json(envelope)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if is_retryable_network_error(&e) {
                    TransportError::retryable(e.to_string())
                } else {
                    TransportError::fatal(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        let reason = format!("http {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
        Err(if is_retryable_http_error(status.as_u16()) {
            TransportError::retryable(reason)
        } else {
            TransportError::fatal(reason)
        })
    }
}
