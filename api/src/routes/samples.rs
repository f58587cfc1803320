use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::state::AppState;

/// Stand-in endpoints for the protected API. They sit behind the gate like
/// any real downstream would and give traffic generators something to
/// attack: a login that mostly fails and a search that happily over-shares.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/search", post(search))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub usernames: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub username: String,
    pub status: &'static str,
    pub details: &'static str,
}

async fn login(Json(request): Json<LoginRequest>) -> (StatusCode, Json<serde_json::Value>) {
    if request.username == "admin" && request.password == "password" {
        (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": "Login successful!",
                "username": request.username,
            })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "success": false,
                "error": "Invalid username or password",
            })),
        )
    }
}

async fn search(Json(request): Json<SearchRequest>) -> (StatusCode, Json<serde_json::Value>) {
    if request.usernames.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No usernames provided" })),
        );
    }

    const STATUSES: &[&str] = &["Active", "Inactive", "Pending", "Suspended"];
    const DETAILS: &[&str] = &[
        "Account verified",
        "Email not confirmed",
        "Premium member",
        "New user",
        "Requires verification",
        "Profile complete",
    ];

    let mut rng = rand::thread_rng();
    let results: Vec<SearchResult> = request
        .usernames
        .into_iter()
        .map(|username| SearchResult {
            username,
            status: STATUSES.choose(&mut rng).copied().unwrap_or("Active"),
            details: DETAILS
                .choose(&mut rng)
                .copied()
                .unwrap_or("Profile complete"),
        })
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "count": results.len(),
            "results": results,
        })),
    )
}
