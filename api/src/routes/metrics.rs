use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use warden_pipeline::metrics::MetricsSnapshot;

use crate::routes::mitigations::LevelTotal;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/warden/metrics", get(metrics))
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct MetricsResponse {
    pub counters: MetricsSnapshot,
    /// Records accepted by the recorder since startup.
    pub records_recorded: u64,
    /// Records lost to queue overflow since startup.
    pub records_dropped: u64,
    /// Records currently queued for the next batch.
    pub queue_depth: usize,
    pub mitigations_active: usize,
    pub level_totals: Vec<LevelTotal>,
    pub cases_total: u64,
    pub generated_at: DateTime<Utc>,
}

/// Counter snapshot plus live gauges: what the guard has seen, dropped,
/// blocked, and currently enforces.
#[utoipa::path(
    get,
    path = "/v1/warden/metrics",
    responses((status = 200, description = "Guard metrics", body = MetricsResponse)),
    tag = "system"
)]
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let level_totals: Vec<LevelTotal> = state
        .store
        .level_totals()
        .await
        .into_iter()
        .map(|(level, count)| LevelTotal { level, count })
        .collect();
    let mitigations_active = level_totals.iter().map(|t| t.count).sum();
    let cases_total = match state.memory.count().await {
        Ok(count) => count,
        Err(err) => {
            tracing::warn!(error = %err, "case count unavailable for metrics");
            0
        }
    };
    Json(MetricsResponse {
        counters: state.metrics.snapshot(),
        records_recorded: state.recorder.recorded(),
        records_dropped: state.recorder.dropped(),
        queue_depth: state.recorder.len(),
        mitigations_active,
        level_totals,
        cases_total,
        generated_at: Utc::now(),
    })
}
