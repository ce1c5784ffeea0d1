//! HTTP call dispatcher for the worker call surface.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{CallDispatcher, DispatchError, InstanceAddress};

/// Dispatches `POST {instance}/call {"message"}` and returns the worker's
/// `{"response"}`.
///
/// The per-call timeout is owned by the router, not here: the router bounds
/// the whole dispatch (including failover bookkeeping) with one deadline.
pub struct HttpCallDispatcher {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CallResponse {
    response: String,
}

impl HttpCallDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpCallDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallDispatcher for HttpCallDispatcher {
    async fn dispatch(
        &self,
        address: &InstanceAddress,
        message: &str,
    ) -> Result<String, DispatchError> {
        let result = self
            .client
            .post(format!("{}/call", address.url))
            .json(&json!({ "message": message }))
            .send()
            .await;

        let response = result.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout {
                    address: address.url.clone(),
                }
            } else {
                DispatchError::Connection {
                    address: address.url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: CallResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Malformed(e.to_string()))?;

        Ok(parsed.response)
    }
}
