use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use warden_core::mitigation::MitigationLevel;
use warden_core::verdict::CalibratedCase;

use warden_pipeline::memory::CaseFilter;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

pub fn read_router() -> Router<AppState> {
    Router::new().route("/v1/warden/cases", get(list_cases))
}

pub fn feedback_router() -> Router<AppState> {
    Router::new().route("/v1/warden/cases/{id}/feedback", post(submit_feedback))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct CaseHistoryQuery {
    /// Restrict to one traffic category
    #[serde(default)]
    pub category: Option<String>,
    /// Restrict to one committed level (wire name, e.g. "temp_block")
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CaseHistoryResponse {
    pub cases: Vec<CalibratedCase>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct FeedbackRequest {
    /// Was the committed decision right for this situation?
    pub correct: bool,
}

/// Paginated calibrated-case history, newest first. This is the decision
/// audit trail the dashboard renders and feedback links point into.
#[utoipa::path(
    get,
    path = "/v1/warden/cases",
    params(CaseHistoryQuery),
    responses(
        (status = 200, description = "Calibrated decision history", body = CaseHistoryResponse),
        (status = 400, description = "Unknown level filter")
    ),
    tag = "cases"
)]
pub async fn list_cases(
    State(state): State<AppState>,
    Query(query): Query<CaseHistoryQuery>,
) -> Result<Json<CaseHistoryResponse>, AppError> {
    let level = match &query.level {
        None => None,
        Some(raw) => Some(MitigationLevel::from_wire(raw).ok_or_else(|| {
            AppError::Validation {
                message: "Unknown mitigation level".to_string(),
                field: Some("level".to_string()),
                received: Some(serde_json::Value::String(raw.clone())),
                docs_hint: Some("One of: none, delay, captcha, temp_block, ban".to_string()),
            }
        })?),
    };

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    let cases = state
        .memory
        .recent(&CaseFilter {
            category: query.category,
            level,
            limit,
            offset,
        })
        .await?;
    Ok(Json(CaseHistoryResponse {
        cases,
        limit,
        offset,
    }))
}

/// Attach a human judgment to a past decision. Idempotent: resubmitting
/// the same judgment is a no-op, a different one overwrites (last write
/// wins). Feedback never rewrites the committed mitigation — it steers
/// future calibrations through retrieval.
#[utoipa::path(
    post,
    path = "/v1/warden/cases/{id}/feedback",
    params(("id" = Uuid, Path, description = "Case id")),
    request_body = FeedbackRequest,
    responses(
        (status = 200, description = "Feedback recorded", body = CalibratedCase),
        (status = 404, description = "Unknown case id")
    ),
    tag = "cases"
)]
pub async fn submit_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<CalibratedCase>, AppError> {
    let case = state.feedback.submit(id, request.correct).await?;
    Ok(Json(case))
}
