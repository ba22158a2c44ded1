//! JSON envelopes shared by the webhook endpoint and error responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use tracing::error;

/// Body of every webhook answer: `{status, message, timestamp}`
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    pub message: String,
    pub timestamp: String,
}

impl WebhookResponse {
    fn new(status: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new("success", message)
    }

    pub fn ignored(message: impl Into<String>) -> Self {
        Self::new("ignored", message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", message)
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Request-path failures. Deployment failures never show up here.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid signature")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Invalid signature".to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(detail) => {
                error!("Error handling request: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(WebhookResponse::error(message))).into_response()
    }
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(WebhookResponse::error("Not found"))).into_response()
}
