//! The synchronous webhook endpoint: verify, dedupe, fan out, 200.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use trunkline_core::types::WebhookEventKind;
use trunkline_queue::Queue;
use trunkline_store::{DedupeStore, WorkspaceStore};

use crate::signature::{verify_challenge, verify_signature};
use crate::{parser, WebhookQueues};

/// Shared state for the intake handlers.
#[derive(Clone)]
pub struct IngestState {
    pub workspaces: Arc<dyn WorkspaceStore>,
    pub dedupe: Arc<dyn DedupeStore>,
    pub queues: WebhookQueues,
    pub max_body_bytes: usize,
    pub dedupe_ttl: Duration,
}

/// Routes: `GET /v1/webhook/{workspace_id}` (subscribe handshake) and
/// `POST /v1/webhook/{workspace_id}` (event intake).
pub fn webhook_router(state: IngestState) -> Router {
    Router::new()
        .route(
            "/v1/webhook/{workspace_id}",
            get(handle_verification).post(handle_intake),
        )
        .layer(axum::extract::DefaultBodyLimit::max(state.max_body_bytes * 2))
        .with_state(state)
}

/// GET — upstream calls this once when the webhook is configured.
async fn handle_verification(
    State(state): State<IngestState>,
    Path(workspace_id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Ok(Some(workspace)) = state.workspaces.get(workspace_id).await else {
        return (StatusCode::NOT_FOUND, String::new());
    };

    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params
        .get("hub.challenge")
        .map(String::as_str)
        .unwrap_or("");

    match verify_challenge(mode, token, challenge, &workspace.verify_token) {
        Some(echo) => {
            info!(workspace_id = %workspace_id, "Webhook subscription verified");
            (StatusCode::OK, echo)
        }
        None => {
            warn!(workspace_id = %workspace_id, mode, "Webhook verification failed");
            (StatusCode::FORBIDDEN, String::new())
        }
    }
}

/// POST — must answer 200 inside the upstream's 3-second retry threshold,
/// so nothing here does row-store work.
async fn handle_intake(
    State(state): State<IngestState>,
    Path(workspace_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    metrics::counter!("webhook.requests").increment(1);

    if body.len() > state.max_body_bytes {
        metrics::counter!("webhook.oversized").increment(1);
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({"error": "body too large"})),
        );
    }

    let Ok(Some(workspace)) = state.workspaces.get(workspace_id).await else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown workspace"})));
    };

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&body, signature, &workspace.webhook_secret) {
        warn!(workspace_id = %workspace_id, "Webhook signature mismatch");
        metrics::counter!("webhook.bad_signature").increment(1);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid signature"})),
        );
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            // Bad JSON from a correctly-signed sender is never retried.
            warn!(workspace_id = %workspace_id, error = %e, "Webhook body is not JSON");
            metrics::counter!("webhook.bad_payload").increment(1);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid json"})),
            );
        }
    };

    let events = parser::extract_events(workspace_id, &payload);
    let mut accepted = 0usize;
    let mut duplicates = 0usize;

    for event in events {
        let fresh = match state
            .dedupe
            .insert_if_absent(workspace_id, &event.event_id, state.dedupe_ttl)
            .await
        {
            Ok(fresh) => fresh,
            Err(e) => {
                // Dedupe store down: prefer duplicate processing over loss.
                warn!(error = %e, "Dedupe store unavailable, accepting event");
                true
            }
        };
        if !fresh {
            debug!(event_id = %event.event_id, "Dropping replayed webhook event");
            metrics::counter!("webhook.duplicates").increment(1);
            duplicates += 1;
            continue;
        }

        let queue = match event.kind {
            WebhookEventKind::Status => &state.queues.statuses,
            WebhookEventKind::InboundMessage => &state.queues.inbound,
            WebhookEventKind::TemplateUpdate => &state.queues.templates,
            WebhookEventKind::PhoneNumberUpdate => &state.queues.quality,
        };
        if let Err(e) = queue.enqueue(event).await {
            // Queue push failed; a non-200 makes the upstream retry the
            // whole batch, and dedupe already recorded the others.
            warn!(error = %e, "Internal queue rejected webhook event");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "enqueue failed"})),
            );
        }
        accepted += 1;
    }

    metrics::counter!("webhook.events_accepted").increment(accepted as u64);
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "accepted": accepted, "duplicates": duplicates})),
    )
}
