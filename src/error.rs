use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to read request body: {0}")]
    Body(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ThrottleResult<T> = Result<T, ThrottleError>;

impl ThrottleError {
    /// True for failures of the storage backend itself.
    pub fn is_storage(&self) -> bool {
        matches!(self, ThrottleError::Redis(_) | ThrottleError::Database(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ThrottleError::Redis(_) | ThrottleError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            ThrottleError::Body(_) => StatusCode::BAD_REQUEST,
            ThrottleError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ThrottleError::Serialization(_)
            | ThrottleError::Configuration(_)
            | ThrottleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_throttle_error(err: &ThrottleError) -> Self {
        let code = err.status_code().as_u16();
        match err {
            ThrottleError::Redis(_) | ThrottleError::Database(_) => {
                Self::new("service_unavailable", "Throttle storage unavailable", code)
            }
            ThrottleError::Body(msg) => Self::new("bad_request", msg, code),
            ThrottleError::Validation(msg) => Self::new("validation_error", msg, code),
            ThrottleError::Configuration(msg) => Self::new("configuration_error", msg, code),
            ThrottleError::Serialization(_) | ThrottleError::Internal(_) => {
                Self::new("internal_error", "Internal server error", code)
            }
        }
    }
}

impl IntoResponse for ThrottleError {
    fn into_response(self) -> Response {
        tracing::error!(target: "throttle_guard::error", error = %self, "Request failed");
        let status = self.status_code();
        (status, Json(ErrorResponse::from_throttle_error(&self))).into_response()
    }
}
