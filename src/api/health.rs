use axum::{Json, extract::State as AxumState};
use chrono::Utc;
use serde::Serialize;

use crate::{SERVICE_NAME, SharedState};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub uptime_seconds: f64,
}

/// GET /health - liveness check
pub async fn health(AxumState(state): AxumState<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
        uptime_seconds: state.start_time.elapsed().as_secs_f64(),
    })
}
