use crate::client_ip::remote_addr;
use crate::throttle::{Role, ThrottleRequests};
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::info;

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client_ip = remote_addr(&request);

    info!(
        target: "throttle_guard::middleware",
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "throttle_guard::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    response
}

/// State of one throttled route: the shared policy plus the route's role.
#[derive(Clone)]
pub struct ThrottleState {
    pub throttle: Arc<ThrottleRequests>,
    pub role: Role,
}

impl ThrottleState {
    pub fn new(throttle: Arc<ThrottleRequests>, role: impl Into<Role>) -> Self {
        Self {
            throttle,
            role: role.into(),
        }
    }
}

/// Throttle middleware for `axum::middleware::from_fn_with_state`.
///
/// ```ignore
/// let state = ThrottleState::new(throttle, "login");
/// Router::new()
///     .route("/login", post(login))
///     .route_layer(middleware::from_fn_with_state(state, throttle));
/// ```
pub async fn throttle(State(state): State<ThrottleState>, request: Request, next: Next) -> Response {
    match state
        .throttle
        .handle(request, move |request| next.run(request), &state.role)
        .await
    {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}
