//! problem+json error responses for the control-plane API.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::OrchestratorError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            r#type: format!("https://aviary.dev/problems/{code}"),
            title: status
                .canonical_reason()
                .unwrap_or("Unknown Error")
                .to_string(),
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            problem: Box::new(ProblemDetails::new(status, code, detail)),
        }
    }

    pub fn bad_request(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, detail)
    }

    pub fn not_found(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, detail)
    }

    pub fn conflict(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, detail)
    }

    pub fn internal(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, detail)
    }

    pub fn unavailable(code: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::SERVICE_UNAVAILABLE, code, detail);
        err.problem.retryable = true;
        err
    }

    pub fn bad_gateway(code: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut err = Self::new(StatusCode::BAD_GATEWAY, code, detail);
        err.problem.retryable = true;
        err
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let detail = err.to_string();
        match err {
            OrchestratorError::InvalidSpec(_) => Self::bad_request("invalid_spec", detail),
            OrchestratorError::UnknownWorker(_) => Self::not_found("unknown_worker", detail),
            OrchestratorError::UnknownDeployment(_) => {
                Self::not_found("unknown_deployment", detail)
            }
            OrchestratorError::NoHealthyEndpoint(_) => {
                Self::unavailable("no_healthy_endpoint", detail)
            }
            OrchestratorError::Dispatch(_) => Self::bad_gateway("dispatch_failed", detail),
            OrchestratorError::Provider(inner) => match inner {
                aviary_provider::ProviderError::DuplicateName(_) => {
                    Self::conflict("duplicate_provider", detail)
                }
                aviary_provider::ProviderError::NotFound(_) => {
                    Self::not_found("unknown_provider", detail)
                }
                aviary_provider::ProviderError::InvalidConfig(_) => {
                    Self::bad_request("invalid_provider_config", detail)
                }
                aviary_provider::ProviderError::Invoke(_) => {
                    Self::bad_gateway("provider_invoke_failed", detail)
                }
            },
            _ => Self::internal("internal", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
