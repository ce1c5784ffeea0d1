//! HTTP template source.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{FetchError, TemplateArtifact, TemplateSource};

/// Default per-request fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches templates over HTTP(S).
///
/// Status mapping drives the pipeline's retry decision: 404 and other 4xx are
/// fatal (the template is wrong), 5xx and transport failures are transient.
pub struct HttpTemplateSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTemplateSource {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpTemplateSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateSource for HttpTemplateSource {
    async fn fetch(&self, uri: &str) -> Result<TemplateArtifact, FetchError> {
        debug!(uri = %uri, "Fetching template");

        let response = self
            .client
            .get(uri)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(uri.to_string()));
        }
        if status.is_client_error() {
            return Err(FetchError::Rejected {
                status: status.as_u16(),
            });
        }
        if status.is_server_error() {
            return Err(FetchError::ServerError {
                status: status.as_u16(),
            });
        }

        let content = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Unreachable(e.to_string())
            }
        })?;

        debug!(uri = %uri, size_bytes = content.len(), "Template fetched");

        Ok(TemplateArtifact {
            uri: uri.to_string(),
            content,
        })
    }
}
