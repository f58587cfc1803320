use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use warden_core::actor::ActorIdentity;
use warden_core::mitigation::{ActiveMitigation, MitigationLevel};

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/warden/mitigations", get(list_mitigations))
        .route("/v1/warden/mitigations/{actor}", delete(lift_mitigation))
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct LevelTotal {
    pub level: MitigationLevel,
    pub count: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MitigationsResponse {
    pub active: Vec<ActiveMitigation>,
    pub totals: Vec<LevelTotal>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct LiftedMitigationResponse {
    pub actor: String,
    pub level: MitigationLevel,
    pub lifted_at: DateTime<Utc>,
}

/// Active mitigation set, newest first, with per-level totals.
#[utoipa::path(
    get,
    path = "/v1/warden/mitigations",
    responses(
        (status = 200, description = "Currently enforced mitigations", body = MitigationsResponse)
    ),
    tag = "mitigations"
)]
pub async fn list_mitigations(State(state): State<AppState>) -> Json<MitigationsResponse> {
    let active = state.store.snapshot().await;
    let totals = state
        .store
        .level_totals()
        .await
        .into_iter()
        .map(|(level, count)| LevelTotal { level, count })
        .collect();
    Json(MitigationsResponse {
        active,
        totals,
        generated_at: Utc::now(),
    })
}

/// Operator override: lift an actor's mitigation immediately. This is one
/// of the two sanctioned de-escalation paths (the other is TTL expiry).
#[utoipa::path(
    delete,
    path = "/v1/warden/mitigations/{actor}",
    params(("actor" = String, Path, description = "Canonical actor identity, e.g. ip:203.0.113.7 or account:mallory")),
    responses(
        (status = 200, description = "Mitigation lifted", body = LiftedMitigationResponse),
        (status = 400, description = "Malformed actor identity"),
        (status = 404, description = "No active mitigation for this actor")
    ),
    tag = "mitigations"
)]
pub async fn lift_mitigation(
    State(state): State<AppState>,
    Path(actor): Path<String>,
) -> Result<Json<LiftedMitigationResponse>, AppError> {
    let actor: ActorIdentity = actor.parse().map_err(|_| AppError::Validation {
        message: "Actor must be given in canonical form".to_string(),
        field: Some("actor".to_string()),
        received: Some(serde_json::Value::String(actor.clone())),
        docs_hint: Some("Use ip:<address> or account:<id>".to_string()),
    })?;

    let lifted = state.store.remove(&actor).await.ok_or(AppError::NotFound {
        message: format!("No active mitigation for '{actor}'"),
    })?;
    tracing::info!(
        actor = %actor,
        level = lifted.level.as_str(),
        case_id = %lifted.case_id,
        "mitigation lifted by operator override"
    );
    Ok(Json(LiftedMitigationResponse {
        actor: actor.to_string(),
        level: lifted.level,
        lifted_at: Utc::now(),
    }))
}
