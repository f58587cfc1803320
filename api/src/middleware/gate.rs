use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tower::{Layer, Service, ServiceExt};
use uuid::Uuid;

use warden_core::actor::ActorIdentity;
use warden_core::error::codes;
use warden_core::mitigation::{ActiveMitigation, MitigationLevel};
use warden_core::record::RequestRecord;

use warden_pipeline::category::CategoryMatcher;
use warden_pipeline::metrics::{GuardMetrics, bump};
use warden_pipeline::recorder::TrafficRecorder;
use warden_pipeline::store::MitigationStore;

use crate::challenge::ChallengeVerifier;
use crate::sanitize::payload_excerpt;

/// Header carrying a solved-challenge token.
pub const CHALLENGE_HEADER: &str = "x-warden-challenge";

/// Jittered hold applied under a delay-level mitigation.
const DELAY_JITTER_MS: std::ops::RangeInclusive<u64> = 100..=500;

/// Bodies larger than this are recorded without an excerpt rather than
/// buffered on the hot path.
const MAX_EXCERPT_BODY_BYTES: usize = 8 * 1024;
const EXCERPT_LIMIT: usize = 512;

/// Account identity injected by an upstream authentication layer, when one
/// is present. The gate treats it as a second mitigation key next to the
/// client IP.
#[derive(Debug, Clone)]
pub struct AuthenticatedAccount(pub String);

/// The per-request hot path: mitigation lookup, policy application, and
/// fire-and-forget traffic capture.
///
/// Everything here is deliberately fail-open: a request the guard cannot
/// attribute or capture still reaches the protected API. The only requests
/// that do not are those under an unexpired block or ban.
#[derive(Clone)]
pub struct GateLayer {
    store: MitigationStore,
    recorder: TrafficRecorder,
    matcher: Arc<CategoryMatcher>,
    metrics: Arc<GuardMetrics>,
    verifier: ChallengeVerifier,
}

impl GateLayer {
    pub fn new(
        store: MitigationStore,
        recorder: TrafficRecorder,
        matcher: Arc<CategoryMatcher>,
        metrics: Arc<GuardMetrics>,
        verifier: ChallengeVerifier,
    ) -> Self {
        Self {
            store,
            recorder,
            matcher,
            metrics,
            verifier,
        }
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            store: self.store.clone(),
            recorder: self.recorder.clone(),
            matcher: self.matcher.clone(),
            metrics: self.metrics.clone(),
            verifier: self.verifier.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GateService<S> {
    inner: S,
    store: MitigationStore,
    recorder: TrafficRecorder,
    matcher: Arc<CategoryMatcher>,
    metrics: Arc<GuardMetrics>,
    verifier: ChallengeVerifier,
}

impl<S> Service<Request> for GateService<S>
where
    S: Service<Request, Response = axum::response::Response, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let store = self.store.clone();
        let recorder = self.recorder.clone();
        let matcher = self.matcher.clone();
        let metrics = self.metrics.clone();
        let verifier = self.verifier.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();
            if is_exempt(&path) {
                return Ok(ready.oneshot(req).await.into_response());
            }
            bump(&metrics.requests_seen);

            let method = req.method().to_string();
            let client_ip = client_ip(&req);
            let account = req
                .extensions()
                .get::<AuthenticatedAccount>()
                .map(|a| a.0.clone());

            let mut actors: Vec<ActorIdentity> = Vec::with_capacity(2);
            if let Some(ip) = client_ip {
                actors.push(ActorIdentity::Ip(ip));
            }
            if let Some(account) = &account {
                actors.push(ActorIdentity::Account(account.clone()));
            }
            if actors.is_empty() {
                // Cannot attribute this request to anyone — fail open and
                // let it through unrecorded rather than punish blindly.
                bump(&metrics.hot_path_failures);
                tracing::warn!(path, "request without a derivable actor identity, failing open");
                return Ok(ready.oneshot(req).await.into_response());
            }

            let active = store.strictest(&actors).await;
            let applied_level = active.as_ref().map(|m| m.level).unwrap_or(MitigationLevel::None);
            match &active {
                None => {}
                Some(mitigation) => match mitigation.level {
                    MitigationLevel::None => {}
                    MitigationLevel::Delay => {
                        let jitter_ms = rand::thread_rng().gen_range(DELAY_JITTER_MS);
                        tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                        bump(&metrics.requests_delayed);
                    }
                    MitigationLevel::Captcha => {
                        let token = req
                            .headers()
                            .get(CHALLENGE_HEADER)
                            .and_then(|v| v.to_str().ok());
                        let cleared =
                            token.is_some_and(|t| verifier.verify(t, &mitigation.actor));
                        if !cleared {
                            bump(&metrics.challenges_issued);
                            return Ok(challenge_response(mitigation));
                        }
                    }
                    MitigationLevel::TempBlock | MitigationLevel::Ban => {
                        bump(&metrics.requests_blocked);
                        return Ok(block_response(mitigation));
                    }
                },
            }

            // Buffer small JSON bodies so the record can carry a sanitized
            // excerpt; anything larger or non-JSON passes through untouched.
            let (req, body_bytes) = buffer_body(req).await;
            let Some(req) = req else {
                bump(&metrics.hot_path_failures);
                return Ok(body_read_failed_response());
            };

            let started = Instant::now();
            let response = ready.oneshot(req).await.into_response();
            let status = response.status().as_u16();
            let latency_ms = started.elapsed().as_millis().min(u32::MAX as u128) as u32;

            let primary = actors
                .first()
                .cloned()
                .expect("actors is non-empty past the fail-open branch");
            let record = RequestRecord {
                timestamp: Utc::now(),
                category: matcher.categorize(&method, &path).to_string(),
                method,
                path,
                actor: primary,
                account,
                status,
                latency_ms,
                payload_excerpt: body_bytes
                    .as_deref()
                    .and_then(|body| payload_excerpt(body, EXCERPT_LIMIT)),
            };
            // Overflow drops the oldest record and bumps a counter; the
            // response path never waits on pipeline work.
            recorder.record(record);

            let mut response = response;
            annotate_response(&mut response, applied_level);
            Ok(response)
        })
    }
}

/// Ops, docs, and health surfaces are not guarded traffic.
fn is_exempt(path: &str) -> bool {
    path == "/health"
        || path.starts_with("/v1/warden/")
        || path.starts_with("/swagger-ui")
        || path.starts_with("/api-doc")
}

/// Client address: first hop of `x-forwarded-for` when present (the guard
/// sits behind the edge proxy), otherwise the socket peer.
fn client_ip(req: &Request) -> Option<IpAddr> {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    forwarded.or_else(|| {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
    })
}

async fn buffer_body(req: Request) -> (Option<Request>, Option<Vec<u8>>) {
    let is_write = matches!(req.method().as_str(), "POST" | "PUT" | "PATCH");
    let is_json = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    let small_enough = req
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_some_and(|len| len <= MAX_EXCERPT_BODY_BYTES);
    if !(is_write && is_json && small_enough) {
        return (Some(req), None);
    }

    let (parts, body) = req.into_parts();
    match axum::body::to_bytes(body, MAX_EXCERPT_BODY_BYTES).await {
        Ok(bytes) => {
            let req = Request::from_parts(parts, axum::body::Body::from(bytes.clone()));
            (Some(req), Some(bytes.to_vec()))
        }
        Err(err) => {
            tracing::warn!(error = %err, "request body could not be read");
            (None, None)
        }
    }
}

fn challenge_response(mitigation: &ActiveMitigation) -> axum::response::Response {
    let request_id = Uuid::now_v7().to_string();
    let body = json!({
        "error": codes::CHALLENGE_REQUIRED,
        "message": "Complete the security challenge to continue.",
        "field": CHALLENGE_HEADER,
        "received": {
            "requires_challenge": true,
            "expires_at": mitigation.expires_at,
        },
        "request_id": request_id,
        "docs_hint": format!(
            "Solve the challenge and resend the request with the issued token in the {CHALLENGE_HEADER} header."
        ),
    });
    let mut response = Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .expect("challenge response should build");
    annotate_response(&mut response, mitigation.level);
    response
}

fn block_response(mitigation: &ActiveMitigation) -> axum::response::Response {
    let request_id = Uuid::now_v7().to_string();
    let (status, message) = match mitigation.level {
        MitigationLevel::Ban => (
            StatusCode::FORBIDDEN,
            "Your access has been permanently blocked due to suspicious activity.",
        ),
        _ => (
            StatusCode::TOO_MANY_REQUESTS,
            "Your access has been temporarily blocked due to suspicious activity. Please try again later.",
        ),
    };
    let body = json!({
        "error": codes::FORBIDDEN,
        "message": message,
        "field": "security.mitigation",
        "received": {
            "level": mitigation.level,
            "expires_at": mitigation.expires_at,
        },
        "request_id": request_id,
    });

    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    if let Some(expires_at) = mitigation.expires_at {
        let retry_after = (expires_at - Utc::now()).num_seconds().max(1);
        builder = builder.header("retry-after", retry_after.to_string());
    }
    let mut response = builder
        .body(axum::body::Body::from(body.to_string()))
        .expect("block response should build");
    annotate_response(&mut response, mitigation.level);
    response
}

fn body_read_failed_response() -> axum::response::Response {
    let request_id = Uuid::now_v7().to_string();
    let body = json!({
        "error": codes::VALIDATION_FAILED,
        "message": "The request body could not be read.",
        "request_id": request_id,
    });
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .expect("body-failure response should build")
}

fn annotate_response(response: &mut axum::response::Response, level: MitigationLevel) {
    if level == MitigationLevel::None {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(level.as_str()) {
        response.headers_mut().insert("x-warden-mitigation", value);
    }
}
