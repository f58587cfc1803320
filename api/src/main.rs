use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use warden_pipeline::calibrator::Calibrator;
use warden_pipeline::category::CategoryMatcher;
use warden_pipeline::classifier::{ClassifierBackend, LlmClassifier};
use warden_pipeline::config::GuardConfig;
use warden_pipeline::feedback::FeedbackChannel;
use warden_pipeline::heuristic::HeuristicClassifier;
use warden_pipeline::memory::CaseMemory;
use warden_pipeline::metrics::GuardMetrics;
use warden_pipeline::recorder::TrafficRecorder;
use warden_pipeline::ruleset::Ruleset;
use warden_pipeline::scheduler::BatchScheduler;
use warden_pipeline::store::MitigationStore;

mod challenge;
mod error;
mod middleware;
mod routes;
mod sanitize;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Warden API",
        version = "0.1.0",
        description = "Inline API-traffic guard: interception gate, adaptive detection pipeline, and the ops surface for mitigations, case history, and feedback."
    ),
    paths(
        routes::health::health_check,
        routes::mitigations::list_mitigations,
        routes::mitigations::lift_mitigation,
        routes::cases::list_cases,
        routes::cases::submit_feedback,
        routes::challenges::issue_challenge_token,
        routes::metrics::metrics,
    ),
    components(schemas(
        HealthResponse,
        routes::mitigations::MitigationsResponse,
        routes::mitigations::LiftedMitigationResponse,
        routes::mitigations::LevelTotal,
        routes::cases::CaseHistoryResponse,
        routes::cases::FeedbackRequest,
        routes::challenges::IssueChallengeRequest,
        routes::challenges::IssueChallengeResponse,
        routes::metrics::MetricsResponse,
        warden_pipeline::metrics::MetricsSnapshot,
        warden_core::error::ApiError,
        warden_core::mitigation::ActiveMitigation,
        warden_core::mitigation::MitigationLevel,
        warden_core::verdict::CalibratedCase,
        warden_core::verdict::CalibrationDecision,
        warden_core::verdict::FeedbackLabel,
        warden_core::actor::ActorIdentity,
    ))
)]
struct ApiDoc;

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden_api=debug,warden_pipeline=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = GuardConfig::from_env();

    // Durable case log when a database is configured; otherwise the guard
    // runs degraded-but-safe on in-memory history.
    let (db, memory) = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .connect(&database_url)
                .await
                .expect("Failed to connect to database");
            sqlx::migrate!("../migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");
            (Some(pool.clone()), CaseMemory::postgres(pool))
        }
        Err(_) => {
            tracing::warn!(
                "DATABASE_URL not set; case memory is in-memory and will not survive a restart"
            );
            (None, CaseMemory::in_memory())
        }
    };

    let store = MitigationStore::new();
    let recorder = TrafficRecorder::new(config.queue_capacity, config.batch_threshold);
    let metrics = Arc::new(GuardMetrics::default());
    let matcher = Arc::new(CategoryMatcher::with_default_rules());
    let ruleset = Ruleset::load(&config.rules_dir, &matcher.categories());
    let verifier = challenge::ChallengeVerifier::from_env();

    let calibrator = Calibrator::new(store.clone(), memory.clone(), metrics.clone(), &config);
    let classifier = match &config.llm_endpoint {
        Some(endpoint) => {
            match LlmClassifier::new(
                endpoint.clone(),
                config.llm_api_key.clone(),
                config.llm_model.clone(),
                config.classifier_timeout,
                metrics.clone(),
            ) {
                Ok(llm) => {
                    tracing::info!(endpoint = %endpoint, model = %config.llm_model, "classifier: llm");
                    ClassifierBackend::Llm(llm)
                }
                Err(err) => {
                    tracing::error!(error = %err, "llm classifier unavailable, falling back to heuristic");
                    ClassifierBackend::Heuristic(HeuristicClassifier)
                }
            }
        }
        None => {
            tracing::info!("classifier: heuristic (no WARDEN_LLM_ENDPOINT configured)");
            ClassifierBackend::Heuristic(HeuristicClassifier)
        }
    };

    let scheduler = BatchScheduler::new(
        recorder.clone(),
        classifier,
        calibrator,
        ruleset,
        metrics.clone(),
        &config,
    );
    tokio::spawn(scheduler.run());
    store.spawn_sweeper(config.sweep_interval);

    // The channel labels decisions in the same case log the calibrator
    // writes and future calibrations retrieve from.
    let feedback = FeedbackChannel::new(memory.clone(), metrics.clone());

    let app_state = state::AppState {
        store: store.clone(),
        memory,
        recorder: recorder.clone(),
        metrics: metrics.clone(),
        feedback,
        verifier: verifier.clone(),
        db,
    };

    let cors_layer = middleware::cors::build_cors_layer();

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::mitigations::router().layer(middleware::rate_limit::ops_read_layer()))
        .merge(routes::cases::read_router().layer(middleware::rate_limit::ops_read_layer()))
        .merge(routes::cases::feedback_router().layer(middleware::rate_limit::feedback_layer()))
        .merge(routes::challenges::router().layer(middleware::rate_limit::challenge_layer()))
        .merge(routes::metrics::router().layer(middleware::rate_limit::ops_read_layer()))
        .merge(routes::samples::router())
        .layer(middleware::gate::GateLayer::new(
            store,
            recorder,
            matcher,
            metrics,
            verifier,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::security_headers::apply))
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Warden listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server terminated unexpectedly");
}
