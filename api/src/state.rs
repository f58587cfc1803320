use std::sync::Arc;

use sqlx::PgPool;

use warden_pipeline::feedback::FeedbackChannel;
use warden_pipeline::memory::CaseMemory;
use warden_pipeline::metrics::GuardMetrics;
use warden_pipeline::recorder::TrafficRecorder;
use warden_pipeline::store::MitigationStore;

use crate::challenge::ChallengeVerifier;

/// Shared handles for the route handlers. The stores are explicit owned
/// components passed in here, never ambient singletons; the scheduler task
/// holds its own clones of the same handles.
#[derive(Clone)]
pub struct AppState {
    pub store: MitigationStore,
    pub memory: CaseMemory,
    pub recorder: TrafficRecorder,
    pub metrics: Arc<GuardMetrics>,
    pub feedback: FeedbackChannel,
    pub verifier: ChallengeVerifier,
    /// Present only when the durable case log is Postgres-backed; drives
    /// the health check.
    pub db: Option<PgPool>,
}
