//! HTTP surface: webhook intake, health check and the status page

pub mod health;
pub mod response;
pub mod status;
pub mod webhook;


use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

use crate::SharedState;

pub use health::health;
pub use response::{ApiError, WebhookResponse, not_found};
pub use status::status;
pub use webhook::handle_webhook;

/// GitHub caps webhook payloads at 25MB
pub const MAX_WEBHOOK_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Builds the application router. Any path or method not listed answers 404.
pub fn router(state: SharedState) -> Router {
    let webhook_path = state.config.webhook_path.clone();

    Router::new()
        .route(&webhook_path, post(handle_webhook).fallback(not_found))
        .route("/health", get(health).fallback(not_found))
        .route("/status", get(status).fallback(not_found))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES))
        .with_state(state)
}
