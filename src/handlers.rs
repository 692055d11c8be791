use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: &str) -> Json<Self> {
        Json(Self {
            message: message.to_string(),
        })
    }
}

/// Health check endpoint, never throttled
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn index() -> impl IntoResponse {
    MessageResponse::new("throttle-guard")
}

/// Login endpoint guarded by the `login` preset.
///
/// Credentials are not checked; the route exists to exercise the two-tier
/// throttle, which has already read the account field when this runs.
pub async fn login(body: Bytes) -> impl IntoResponse {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, MessageResponse::new("Missing credentials"));
    }

    (StatusCode::OK, MessageResponse::new("Login accepted"))
}

/// Sample API endpoint, excluded from throttling by the `api/*` pattern
pub async fn ping() -> impl IntoResponse {
    MessageResponse::new("pong")
}
