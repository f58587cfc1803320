use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use warden_core::actor::ActorIdentity;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_TOKEN_TTL_SECS: i64 = 15 * 60;
const MAX_TOKEN_TTL_SECS: i64 = 60 * 60;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/warden/challenges", post(issue_challenge_token))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct IssueChallengeRequest {
    /// Canonical actor identity the challenge was solved for
    pub actor: String,
    /// Token lifetime in seconds (default 900, max 3600)
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct IssueChallengeResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Mint a challenge token for an actor that just solved the external
/// captcha. Called by the challenge frontend after its provider confirms
/// the solve; the gate then accepts the token locally with no per-request
/// network round-trip.
#[utoipa::path(
    post,
    path = "/v1/warden/challenges",
    request_body = IssueChallengeRequest,
    responses(
        (status = 200, description = "Token issued", body = IssueChallengeResponse),
        (status = 400, description = "Malformed actor identity"),
        (status = 500, description = "Challenge secret not configured")
    ),
    tag = "challenges"
)]
pub async fn issue_challenge_token(
    State(state): State<AppState>,
    Json(request): Json<IssueChallengeRequest>,
) -> Result<Json<IssueChallengeResponse>, AppError> {
    let actor: ActorIdentity = request.actor.parse().map_err(|_| AppError::Validation {
        message: "Actor must be given in canonical form".to_string(),
        field: Some("actor".to_string()),
        received: Some(serde_json::Value::String(request.actor.clone())),
        docs_hint: Some("Use ip:<address> or account:<id>".to_string()),
    })?;
    let ttl = Duration::seconds(
        request
            .ttl_secs
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS)
            .clamp(1, MAX_TOKEN_TTL_SECS),
    );

    let (token, expires_at) = state.verifier.issue(&actor, ttl).ok_or_else(|| {
        AppError::Internal("WARDEN_CHALLENGE_SECRET must be configured".to_string())
    })?;
    tracing::info!(actor = %actor, %expires_at, "challenge token issued");
    Ok(Json(IssueChallengeResponse { token, expires_at }))
}
