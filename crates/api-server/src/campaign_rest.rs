//! REST handlers for campaign creation and lifecycle control.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use trunkline_campaign::CampaignExecutor;
use trunkline_core::types::{Campaign, CampaignCounters, CampaignStatus};
use trunkline_store::CampaignStore;

use crate::auth::AuthClaims;
use crate::rest::ErrorResponse;

#[derive(Clone)]
pub struct CampaignState {
    pub executor: CampaignExecutor,
}

#[derive(Debug, Deserialize)]
pub struct CreateCampaignRequest {
    pub workspace_id: Uuid,
    pub name: String,
    pub phone_number_id: String,
    pub template_name: String,
    #[serde(default = "default_language")]
    pub template_language: String,
    pub contact_ids: Vec<Uuid>,
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Serialize)]
pub struct CampaignResponse {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
    pub counters: CampaignCounters,
}

fn forbidden() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorResponse {
            error: "workspace_forbidden".into(),
            message: "token does not grant this workspace".into(),
        }),
    )
}

fn campaign_error(e: trunkline_core::TrunklineError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse {
            error: "campaign_transition".into(),
            message: e.to_string(),
        }),
    )
}

async fn load_checked(
    state: &CampaignState,
    claims: &AuthClaims,
    id: Uuid,
) -> Result<Campaign, (StatusCode, Json<ErrorResponse>)> {
    let campaign = state
        .executor
        .campaigns
        .get(id)
        .await
        .map_err(|e| {
            error!(error = %e, "Campaign lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "store_error".into(),
                    message: e.to_string(),
                }),
            )
        })?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: "unknown_campaign".into(),
                    message: format!("no campaign {id}"),
                }),
            )
        })?;
    if !claims.allows(campaign.workspace_id) {
        return Err(forbidden());
    }
    Ok(campaign)
}

/// POST /v1/campaigns — create a draft.
pub async fn handle_create(
    State(state): State<CampaignState>,
    Extension(claims): Extension<AuthClaims>,
    Json(request): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<CampaignResponse>), (StatusCode, Json<ErrorResponse>)> {
    if !claims.allows(request.workspace_id) {
        return Err(forbidden());
    }

    let campaign = Campaign {
        id: Uuid::new_v4(),
        workspace_id: request.workspace_id,
        name: request.name,
        phone_number_id: request.phone_number_id,
        template_name: request.template_name,
        template_language: request.template_language,
        contact_ids: request.contact_ids,
        status: CampaignStatus::Draft,
        counters: CampaignCounters::default(),
        created_at: chrono::Utc::now(),
        started_at: None,
        paused_at: None,
        completed_at: None,
    };
    let id = campaign.id;
    state
        .executor
        .campaigns
        .insert(campaign)
        .await
        .map_err(campaign_error)?;

    info!(campaign_id = %id, "Campaign created");
    Ok((
        StatusCode::CREATED,
        Json(CampaignResponse {
            campaign_id: id,
            status: CampaignStatus::Draft,
            counters: CampaignCounters::default(),
        }),
    ))
}

/// GET /v1/campaigns/{id} — status and counters.
pub async fn handle_get(
    State(state): State<CampaignState>,
    Extension(claims): Extension<AuthClaims>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignResponse>, (StatusCode, Json<ErrorResponse>)> {
    let campaign = load_checked(&state, &claims, id).await?;
    Ok(Json(CampaignResponse {
        campaign_id: campaign.id,
        status: campaign.status,
        counters: campaign.counters,
    }))
}

/// POST /v1/campaigns/{id}/start — Draft -> Scheduled.
pub async fn handle_start(
    State(state): State<CampaignState>,
    Extension(claims): Extension<AuthClaims>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    load_checked(&state, &claims, id).await?;
    state.executor.start(id).await.map_err(campaign_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /v1/campaigns/{id}/trigger — Scheduled -> Sending, spawns the
/// batch loop.
pub async fn handle_trigger(
    State(state): State<CampaignState>,
    Extension(claims): Extension<AuthClaims>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    load_checked(&state, &claims, id).await?;
    state.executor.trigger(id).await.map_err(campaign_error)?;
    tokio::spawn(state.executor.clone().drive(id));
    Ok(StatusCode::ACCEPTED)
}

/// POST /v1/campaigns/{id}/pause.
pub async fn handle_pause(
    State(state): State<CampaignState>,
    Extension(claims): Extension<AuthClaims>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    load_checked(&state, &claims, id).await?;
    state.executor.pause(id).await.map_err(campaign_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /v1/campaigns/{id}/resume — Paused -> Sending, re-spawns the loop.
pub async fn handle_resume(
    State(state): State<CampaignState>,
    Extension(claims): Extension<AuthClaims>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    load_checked(&state, &claims, id).await?;
    state.executor.resume(id).await.map_err(campaign_error)?;
    tokio::spawn(state.executor.clone().drive(id));
    Ok(StatusCode::ACCEPTED)
}

/// POST /v1/campaigns/{id}/cancel — tombstone plus status flip.
pub async fn handle_cancel(
    State(state): State<CampaignState>,
    Extension(claims): Extension<AuthClaims>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    load_checked(&state, &claims, id).await?;
    state.executor.cancel(id).await.map_err(campaign_error)?;
    Ok(StatusCode::ACCEPTED)
}
