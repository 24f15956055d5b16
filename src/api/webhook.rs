//! Webhook handler for GitHub push events

use axum::{
    Json,
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::SharedState;
use crate::event::{FilterDecision, PushEvent, evaluate};
use crate::pipeline::DeployAttempt;
use crate::signature;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";

/// JSON body of every webhook answer. Outcomes carry a `message`,
/// refusals and skips carry a `reason`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WebhookResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

type Reply = (StatusCode, Json<WebhookResponse>);

fn with_reason(code: StatusCode, status: &str, reason: impl Into<String>) -> Reply {
    (
        code,
        Json(WebhookResponse {
            status: status.to_string(),
            message: None,
            reason: Some(reason.into()),
        }),
    )
}

fn with_message(code: StatusCode, status: &str, message: String) -> Reply {
    (
        code,
        Json(WebhookResponse {
            status: status.to_string(),
            message: Some(message),
            reason: None,
        }),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Handles the GitHub webhook POST request.
///
/// The signature is checked against the raw body before anything is
/// parsed. Deployments run before the response is sent.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    if !state.config.has_secret() {
        state
            .log
            .warn("No WEBHOOK_SECRET set, skipping signature verification")
            .await;
    }

    let signature = header_str(&headers, SIGNATURE_HEADER);
    if !signature::verify(&body, signature, &state.config.webhook_secret) {
        state.log.log("Rejected: invalid signature").await;
        return with_reason(StatusCode::FORBIDDEN, "rejected", "invalid signature");
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            info!("Could not parse JSON body: {:?}", e);
            return with_reason(
                StatusCode::BAD_REQUEST,
                "rejected",
                "malformed JSON payload",
            );
        }
    };

    let event_type = header_str(&headers, EVENT_HEADER);
    if event_type != "push" {
        state.log.log(format!("Ignored event: {}", event_type)).await;
        return with_reason(StatusCode::OK, "ignored", "not a push event");
    }

    let event = PushEvent::from_json(&payload);
    debug!("{:#?}", &event);
    if let FilterDecision::Ignore(reason) = evaluate(
        &event,
        &state.config.branch,
        &state.config.watched_path_prefix,
    ) {
        state
            .log
            .log(format!("Ignored push to '{}': {}", event.git_ref, reason))
            .await;
        return with_reason(StatusCode::OK, "ignored", reason);
    }

    state
        .log
        .log(format!("==> Deploying from push by {}...", event.pusher_name()))
        .await;

    match state.deployer.deploy().await {
        DeployAttempt::Busy => with_reason(
            StatusCode::CONFLICT,
            "busy",
            "deployment already in progress",
        ),
        DeployAttempt::Completed(result) => {
            if result.success {
                with_message(StatusCode::OK, "success", result.message)
            } else {
                with_message(StatusCode::INTERNAL_SERVER_ERROR, "failed", result.message)
            }
        }
    }
}
