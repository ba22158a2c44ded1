//! Webhook related structures and event routing

use axum::body::Bytes;
use axum::http::HeaderMap;
use serde_json::Value;
use std::fmt;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// An inbound webhook delivery.
///
/// `raw_body` is kept exactly as received so the signature is checked over
/// the bytes the sender signed.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub raw_body: Bytes,
    pub signature_header: Option<String>,
    pub event_type: String,
    pub delivery_id: String,
}

impl WebhookRequest {
    pub fn from_parts(headers: &HeaderMap, raw_body: Bytes) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        Self {
            raw_body,
            signature_header: header(SIGNATURE_HEADER),
            event_type: header(EVENT_HEADER).unwrap_or_default(),
            delivery_id: header(DELIVERY_HEADER).unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Fields of a push payload used for routing and logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub git_ref: String,
    pub repository_full_name: String,
    pub commit_sha: Option<String>,
    pub pusher_name: Option<String>,
}

impl PushEvent {
    pub fn from_payload(payload: &Value) -> Self {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).map(String::from);

        Self {
            git_ref: text(payload.get("ref")).unwrap_or_default(),
            repository_full_name: text(
                payload.get("repository").and_then(|r| r.get("full_name")),
            )
            .unwrap_or_else(|| "unknown".to_string()),
            commit_sha: text(payload.get("after")),
            pusher_name: text(payload.get("pusher").and_then(|p| p.get("name"))),
        }
    }
}

/// Why a delivery did not lead to a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Connectivity test from the sender; answered as a success
    Ping,
    NonTargetRef(String),
    UnhandledEvent(String),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::Ping => write!(f, "ping acknowledged"),
            IgnoreReason::NonTargetRef(git_ref) => write!(f, "non-main ref: {}", git_ref),
            IgnoreReason::UnhandledEvent(event) => write!(f, "unhandled event type: {}", event),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    TriggerDeploy(PushEvent),
    Ignore(IgnoreReason),
}

/// Decides what a verified, parsed delivery should do.
///
/// Only a push whose `ref` equals `target_ref` (e.g. `refs/heads/main`)
/// triggers a deployment.
pub fn route(event_type: &str, payload: &Value, target_ref: &str) -> Action {
    match event_type {
        "push" => {
            let push = PushEvent::from_payload(payload);
            if push.git_ref == target_ref {
                Action::TriggerDeploy(push)
            } else {
                Action::Ignore(IgnoreReason::NonTargetRef(push.git_ref))
            }
        }
        "ping" => Action::Ignore(IgnoreReason::Ping),
        other => Action::Ignore(IgnoreReason::UnhandledEvent(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    const MAIN: &str = "refs/heads/main";

    #[test]
    fn push_to_main_triggers_deploy() {
        let payload = json!({
            "ref": "refs/heads/main",
            "after": "0d1a26e67d8f5eaf1f6ba5c57fc3c7d91ac0fd1c",
            "repository": { "full_name": "octo/site" },
            "pusher": { "name": "octocat" }
        });

        match route("push", &payload, MAIN) {
            Action::TriggerDeploy(push) => {
                assert_eq!(push.git_ref, "refs/heads/main");
                assert_eq!(push.repository_full_name, "octo/site");
                assert_eq!(
                    push.commit_sha.as_deref(),
                    Some("0d1a26e67d8f5eaf1f6ba5c57fc3c7d91ac0fd1c")
                );
                assert_eq!(push.pusher_name.as_deref(), Some("octocat"));
            }
            other => panic!("expected deploy, got {:?}", other),
        }
    }

    #[test]
    fn push_to_other_branch_is_ignored() {
        let action = route("push", &json!({ "ref": "refs/heads/dev" }), MAIN);
        assert_eq!(
            action,
            Action::Ignore(IgnoreReason::NonTargetRef("refs/heads/dev".into()))
        );
        if let Action::Ignore(reason) = action {
            assert_eq!(reason.to_string(), "non-main ref: refs/heads/dev");
        }
    }

    #[test]
    fn push_without_ref_is_ignored() {
        assert_eq!(
            route("push", &json!({}), MAIN),
            Action::Ignore(IgnoreReason::NonTargetRef(String::new()))
        );
    }

    #[test]
    fn tag_push_is_not_a_branch_push() {
        assert!(matches!(
            route("push", &json!({ "ref": "refs/tags/main" }), MAIN),
            Action::Ignore(IgnoreReason::NonTargetRef(_))
        ));
    }

    #[test]
    fn target_ref_follows_configured_branch() {
        let payload = json!({ "ref": "refs/heads/production" });
        assert!(matches!(
            route("push", &payload, "refs/heads/production"),
            Action::TriggerDeploy(_)
        ));
        assert!(matches!(route("push", &payload, MAIN), Action::Ignore(_)));
    }

    #[test]
    fn ping_is_acknowledged() {
        let action = route("ping", &json!({}), MAIN);
        assert_eq!(action, Action::Ignore(IgnoreReason::Ping));
        if let Action::Ignore(reason) = action {
            assert_eq!(reason.to_string(), "ping acknowledged");
        }
    }

    #[test]
    fn other_events_are_unhandled() {
        let action = route("issues", &json!({}), MAIN);
        assert_eq!(
            action,
            Action::Ignore(IgnoreReason::UnhandledEvent("issues".into()))
        );
        if let Action::Ignore(reason) = action {
            assert_eq!(reason.to_string(), "unhandled event type: issues");
        }
    }

    #[test]
    fn missing_repository_defaults_to_unknown() {
        let push = PushEvent::from_payload(&json!({ "ref": "refs/heads/main" }));
        assert_eq!(push.repository_full_name, "unknown");
        assert_eq!(push.commit_sha, None);
    }

    #[test]
    fn request_reads_github_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("sha256=abc"));
        headers.insert(EVENT_HEADER, HeaderValue::from_static("push"));
        headers.insert(DELIVERY_HEADER, HeaderValue::from_static("72d3162e"));

        let request = WebhookRequest::from_parts(&headers, Bytes::from_static(b"{}"));
        assert_eq!(request.signature_header.as_deref(), Some("sha256=abc"));
        assert_eq!(request.event_type, "push");
        assert_eq!(request.delivery_id, "72d3162e");
        assert_eq!(&request.raw_body[..], b"{}");

        let bare = WebhookRequest::from_parts(&HeaderMap::new(), Bytes::new());
        assert_eq!(bare.signature_header, None);
        assert_eq!(bare.event_type, "");
        assert_eq!(bare.delivery_id, "unknown");
    }
}
