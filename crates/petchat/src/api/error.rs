//! Unified API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::bridge::BridgeError;
use crate::worker::WorkerError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Chatbot error: {0}")]
    Worker(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Worker(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Worker(_) => "WORKER_ERROR",
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
    pub code: u16,
    pub error: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) | ApiError::GatewayTimeout(msg) => {
                warn!(error_code = code, message = %msg, "Chatbot unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            status: "error",
            message,
            code: status.as_u16(),
            error: code,
        };

        (status, Json(body)).into_response()
    }
}

impl From<WorkerError> for ApiError {
    fn from(err: WorkerError) -> Self {
        let msg = err.to_string();
        match err {
            WorkerError::Spawn { .. } | WorkerError::Exited(_) => Self::ServiceUnavailable(msg),
            WorkerError::Timeout(_) => Self::GatewayTimeout(msg),
            WorkerError::Stderr(_) | WorkerError::Protocol(_) => Self::BadGateway(msg),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Validation(msg) => Self::BadRequest(msg),
            BridgeError::NotFound(id) => Self::NotFound(format!("conversation {}", id)),
            BridgeError::WorkerFailure(msg) => Self::Worker(msg),
            BridgeError::Config(msg) => Self::Internal(msg),
            BridgeError::Worker(err) => err.into(),
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_validation_maps_to_bad_request() {
        let err: ApiError = BridgeError::Validation("Message is required".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "BAD_REQUEST");
    }

    #[test]
    fn test_not_found_mapping() {
        let err: ApiError = BridgeError::NotFound("c1".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "Resource not found: conversation c1");
    }

    #[test]
    fn test_worker_failure_mapping() {
        let err: ApiError = BridgeError::WorkerFailure("quota exceeded".into()).into();
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.error_code(), "WORKER_ERROR");
    }

    #[test]
    fn test_worker_error_mapping() {
        let cases = [
            (
                WorkerError::spawn("python3", "missing"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                WorkerError::Exited("exit status: 1".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                WorkerError::Timeout(Duration::from_secs(30)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (WorkerError::Stderr("Traceback".into()), StatusCode::BAD_GATEWAY),
            (
                WorkerError::Protocol("no response".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (worker_err, status) in cases {
            let err: ApiError = BridgeError::Worker(worker_err).into();
            assert_eq!(err.status_code(), status);
        }
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let response = ApiError::bad_request("Message is required").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["code"], 400);
        assert_eq!(json["error"], "BAD_REQUEST");
        assert_eq!(json["message"], "Bad request: Message is required");
    }
}
