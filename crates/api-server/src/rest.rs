//! REST handlers for message sends and status reads.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use trunkline_core::command::{CommandKind, OutboundCommand};
use trunkline_core::error::SendError;
use trunkline_core::event_bus::EventSink;
use trunkline_core::types::{parse_messaging_tier, Message, MessageStatus, QualityRating};
use trunkline_dispatcher::enqueue_command;
use trunkline_queue::Queue;
use trunkline_store::{MessageStore, PhoneNumberStore};
use trunkline_upstream::CloudApiClient;

use crate::auth::AuthClaims;

/// Shared application state for message handlers.
#[derive(Clone)]
pub struct AppState {
    pub messages: Arc<dyn MessageStore>,
    pub phones: Arc<dyn PhoneNumberStore>,
    pub queue: Arc<dyn Queue<OutboundCommand>>,
    pub events: Arc<dyn EventSink>,
    /// Direct client for admin-path calls (quality/tier refresh).
    pub upstream: Arc<CloudApiClient>,
    pub node_id: String,
    pub start_time: std::time::Instant,
}

/// POST /v1/messages body: the command kind flattened next to routing.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub workspace_id: Uuid,
    /// Upstream phone-number id to send from.
    pub phone_number_id: String,
    pub to: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(flatten)]
    pub payload: CommandKind,
}

#[derive(Serialize)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
    pub status: MessageStatus,
}

#[derive(Serialize)]
pub struct MessageStatusResponse {
    pub message_id: Uuid,
    pub status: MessageStatus,
    pub upstream_message_id: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<SendError>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    pub delivered_at: Option<chrono::DateTime<chrono::Utc>>,
    pub read_at: Option<chrono::DateTime<chrono::Utc>>,
    pub failed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn error_response(
    status: StatusCode,
    error: &str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// POST /v1/messages — validate, persist `Pending -> Queued`, enqueue.
pub async fn handle_send(
    State(state): State<AppState>,
    Extension(claims): Extension<AuthClaims>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<SendMessageResponse>), (StatusCode, Json<ErrorResponse>)> {
    if !claims.allows(request.workspace_id) {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "workspace_forbidden",
            "token does not grant this workspace",
        ));
    }

    let phone = state
        .phones
        .get_by_upstream(request.workspace_id, &request.phone_number_id)
        .await
        .map_err(|e| {
            error!(error = %e, "Phone number lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        })?
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "unknown_phone_number",
                format!("phone number {} not in workspace", request.phone_number_id),
            )
        })?;

    let cmd = OutboundCommand {
        message_id: Uuid::new_v4(),
        workspace_id: request.workspace_id,
        phone_number_id: phone.phone_number_id.clone(),
        access_token: phone.access_token.clone(),
        to: request.to.clone(),
        reply_to: request.reply_to.clone(),
        campaign_id: None,
        payload: request.payload,
    };

    // Reject malformed commands before a row exists.
    if let Err(e) = trunkline_renderer::validate(&cmd) {
        metrics::counter!("api.send_rejected").increment(1);
        return Err(error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_command",
            e.to_string(),
        ));
    }

    let row = Message::outbound(
        cmd.workspace_id,
        cmd.phone_number_id.clone(),
        cmd.payload.message_kind(),
        cmd.to.clone(),
        serde_json::to_value(&cmd.payload).unwrap_or_default(),
        None,
    );

    let message_id = enqueue_command(
        state.messages.as_ref(),
        state.queue.as_ref(),
        state.events.as_ref(),
        row,
        cmd,
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Enqueue failed");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "enqueue_failed", e.to_string())
    })?;

    info!(message_id = %message_id, subject = %claims.subject, "Message accepted");
    metrics::counter!("api.messages_accepted").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(SendMessageResponse {
            message_id,
            status: MessageStatus::Queued,
        }),
    ))
}

/// GET /v1/messages/{id} — terminal-state read for the API client. Internal
/// retries are not observable here.
pub async fn handle_message_status(
    State(state): State<AppState>,
    Extension(claims): Extension<AuthClaims>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let message = state
        .messages
        .get(id)
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        })?
        .filter(|m| claims.allows(m.workspace_id))
        .ok_or_else(|| {
            error_response(StatusCode::NOT_FOUND, "unknown_message", format!("no message {id}"))
        })?;

    Ok(Json(MessageStatusResponse {
        message_id: message.id,
        status: message.status,
        upstream_message_id: message.upstream_message_id,
        attempt_count: message.attempt_count,
        last_error: message.last_error,
        created_at: message.created_at,
        sent_at: message.sent_at,
        delivered_at: message.delivered_at,
        read_at: message.read_at,
        failed_at: message.failed_at,
    }))
}

#[derive(Serialize)]
pub struct PhoneRefreshResponse {
    pub phone_number_id: String,
    pub quality_rating: QualityRating,
    pub messaging_limit_tier: Option<String>,
    pub daily_cap: u64,
}

/// POST /v1/phone-numbers/{phone_number_id}/refresh — re-derive quality
/// rating and messaging tier from the upstream graph.
pub async fn handle_refresh_phone(
    State(state): State<AppState>,
    Extension(claims): Extension<AuthClaims>,
    Path(phone_number_id): Path<String>,
) -> Result<Json<PhoneRefreshResponse>, (StatusCode, Json<ErrorResponse>)> {
    let phone = state
        .phones
        .find_by_upstream(&phone_number_id)
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        })?
        .filter(|p| claims.allows(p.workspace_id))
        .ok_or_else(|| {
            error_response(
                StatusCode::NOT_FOUND,
                "unknown_phone_number",
                format!("no phone number {phone_number_id}"),
            )
        })?;

    let info = state
        .upstream
        .fetch_phone_number(&phone.phone_number_id, &phone.access_token)
        .await
        .map_err(|e| {
            error_response(StatusCode::BAD_GATEWAY, "upstream_error", e.to_string())
        })?;

    let rating = info
        .quality_rating
        .as_deref()
        .map(QualityRating::parse)
        .unwrap_or(QualityRating::Unknown);
    state
        .phones
        .update_quality(&phone.phone_number_id, rating, info.messaging_limit_tier.clone())
        .await
        .map_err(|e| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        })?;

    info!(phone_number_id = %phone.phone_number_id, rating = ?rating, "Phone number refreshed");
    Ok(Json(PhoneRefreshResponse {
        phone_number_id: phone.phone_number_id,
        quality_rating: rating,
        daily_cap: parse_messaging_tier(info.messaging_limit_tier.as_deref()),
        messaging_limit_tier: info.messaging_limit_tier,
    }))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// GET /health — health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /ready — readiness probe.
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live — liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
