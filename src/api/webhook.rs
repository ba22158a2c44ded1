//! Webhook handler for GitHub push and ping events

use axum::{body::Bytes, extract::State as AxumState, http::HeaderMap};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::SharedState;
use crate::api::response::{ApiError, WebhookResponse};
use crate::deploy::TriggerOutcome;
use crate::utils::verify_github_signature;
use crate::webhook::{Action, IgnoreReason, WebhookRequest, route};

/// Handles the GitHub webhook POST request.
///
/// Answers as soon as the delivery is classified. A triggered deployment runs
/// in the background and reports only through the log.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<WebhookResponse, ApiError> {
    if body.is_empty() {
        warn!("Rejected webhook with empty body");
        return Err(ApiError::BadRequest("No content".to_string()));
    }

    let request = WebhookRequest::from_parts(&headers, body);
    info!(
        "Received webhook: event={}, delivery={}",
        request.event_type, request.delivery_id
    );

    let secret = state.config.secret();
    if secret.is_none() {
        warn!("No webhook secret configured - skipping signature verification");
    }
    if !verify_github_signature(
        secret,
        &request.raw_body,
        request.signature_header.as_deref(),
    ) {
        if request.signature_header.is_none() {
            error!("No signature provided for delivery {}", request.delivery_id);
        }
        error!("Invalid signature for delivery {}", request.delivery_id);
        return Err(ApiError::Unauthorized);
    }
    if secret.is_some() {
        info!("Signature verified for delivery {}", request.delivery_id);
    }

    let payload: Value = serde_json::from_slice(&request.raw_body).map_err(|e| {
        error!("Invalid JSON payload: {}", e);
        ApiError::BadRequest("Invalid JSON".to_string())
    })?;
    if !payload.is_object() {
        error!("Invalid JSON payload: expected an object");
        return Err(ApiError::BadRequest("Invalid JSON".to_string()));
    }

    let response = match route(&request.event_type, &payload, &state.config.target_ref()) {
        Action::TriggerDeploy(push) => {
            info!(
                "Push event: {} -> {} (after {}, by {})",
                push.repository_full_name,
                push.git_ref,
                push.commit_sha.as_deref().unwrap_or("unknown"),
                push.pusher_name.as_deref().unwrap_or("unknown"),
            );
            info!(
                "Push to {} branch detected, triggering deployment...",
                state.config.branch
            );
            // Dropping the handle detaches the run
            match state.deployer.trigger() {
                TriggerOutcome::Started(_) => WebhookResponse::success("Deployment triggered"),
                TriggerOutcome::Queued => WebhookResponse::success(
                    "Deployment queued behind the deployment in progress",
                ),
                TriggerOutcome::AlreadyQueued => {
                    WebhookResponse::success("Deployment already queued")
                }
            }
        }
        Action::Ignore(IgnoreReason::Ping) => {
            info!("Ping event received");
            WebhookResponse::success("Webhook endpoint is working")
        }
        Action::Ignore(IgnoreReason::NonTargetRef(git_ref)) => {
            info!(
                "Ignoring push to {} (not {} branch)",
                git_ref, state.config.branch
            );
            WebhookResponse::ignored(format!(
                "Push to {} ignored (not {} branch)",
                git_ref, state.config.branch
            ))
        }
        Action::Ignore(IgnoreReason::UnhandledEvent(event_type)) => {
            info!("Ignoring event type: {}", event_type);
            WebhookResponse::ignored(format!("Event type {} ignored", event_type))
        }
    };

    Ok(response)
}
