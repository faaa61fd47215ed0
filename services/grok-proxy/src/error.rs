//! Per-request failures rendered as OpenAI-style error bodies

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Request-level errors returned to API callers.
///
/// Upstream failures carry only the request id; upstream status codes and
/// bodies stay in the logs.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing API key")]
    MissingApiKey,

    #[error("Invalid API key format")]
    MalformedApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("The upstream service failed to complete the request")]
    Upstream { request_id: String },

    #[error("Server is shutting down")]
    ShuttingDown,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingApiKey | ApiError::MalformedApiKey | ApiError::InvalidApiKey => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::Upstream { .. } => "upstream_error",
            ApiError::ShuttingDown => "server_error",
            _ => "invalid_request_error",
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            ApiError::MissingApiKey | ApiError::MalformedApiKey | ApiError::InvalidApiKey => {
                Some("invalid_api_key")
            }
            _ => None,
        }
    }

    /// The `{"error": {...}}` body shared by plain and SSE responses.
    pub fn body(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "message": self.to_string(),
            "type": self.error_type(),
            "param": null,
            "code": self.code(),
        });
        if let ApiError::Upstream { request_id } = self {
            error["request_id"] = serde_json::Value::String(request_id.clone());
        }
        serde_json::json!({ "error": error })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            self.body().to_string(),
        )
            .into_response()
    }
}
