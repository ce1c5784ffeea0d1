//! Transport seam between the registry and provider backends.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::config::ProviderConfig;

/// Errors from a provider transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no endpoint configured for provider '{0}'")]
    MissingEndpoint(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// The only surface a provider backend exposes to the fleet.
///
/// Implementations own all provider-specific wire details. The registry binds
/// a transport to a stored config; callers never see credentials or models.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// Run one completion against the configured backend.
    async fn complete(&self, config: &ProviderConfig, input: &str) -> Result<String, TransportError>;
}

/// Default invocation timeout.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Generic JSON-over-HTTP completion transport.
///
/// Speaks the minimal shape `POST {endpoint} {"model", "input"}` with bearer
/// credentials and expects `{"output": "..."}` back. Providers with richer
/// protocols plug in their own [`ProviderTransport`].
pub struct HttpCompletionTransport {
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct CompletionResponse {
    output: String,
}

impl HttpCompletionTransport {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_INVOKE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpCompletionTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderTransport for HttpCompletionTransport {
    async fn complete(&self, config: &ProviderConfig, input: &str) -> Result<String, TransportError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| TransportError::MissingEndpoint(config.name.clone()))?;

        debug!(provider = %config.name, model = %config.model, "Invoking provider");

        let response = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .bearer_auth(config.credentials.expose())
            .json(&json!({
                "model": config.model,
                "input": input,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        Ok(parsed.output)
    }
}
