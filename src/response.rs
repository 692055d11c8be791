use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATELIMIT_LIMIT: &str = "ratelimit-limit";
pub const RATELIMIT_REMAINING: &str = "ratelimit-remaining";
pub const RATELIMIT_RESET: &str = "ratelimit-reset";

pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too Many Requests";

#[derive(Debug, Serialize)]
pub struct ThrottledResponse {
    pub message: String,
}

/// Attach the rate limit header set. `reset_at` is a unix timestamp.
pub fn apply_rate_limit_headers(response: &mut Response, limit: u64, remaining: u64, reset_at: u64) {
    let headers = response.headers_mut();
    set_number(headers, X_RATELIMIT_LIMIT, limit);
    set_number(headers, X_RATELIMIT_REMAINING, remaining);
    set_number(headers, RATELIMIT_LIMIT, limit);
    set_number(headers, RATELIMIT_REMAINING, remaining);
    set_number(headers, RATELIMIT_RESET, reset_at);
}

/// The 429 response, JSON or plain text depending on what the client accepts.
pub fn too_many_requests(wants_json: bool, limit: u64, retry_after: u64, reset_at: u64) -> Response {
    let mut response = if wants_json {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ThrottledResponse {
                message: TOO_MANY_REQUESTS_MESSAGE.to_string(),
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            TOO_MANY_REQUESTS_MESSAGE,
        )
            .into_response()
    };

    set_number(response.headers_mut(), RETRY_AFTER.as_str(), retry_after);
    apply_rate_limit_headers(&mut response, limit, 0, reset_at);
    response
}

fn set_number(headers: &mut HeaderMap, name: &'static str, value: u64) {
    headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn header(response: &Response, name: &str) -> String {
        response.headers()[name].to_str().unwrap().to_string()
    }

    #[test]
    fn test_apply_rate_limit_headers() {
        let mut response = StatusCode::OK.into_response();
        apply_rate_limit_headers(&mut response, 60, 59, 1_700_000_060);

        assert_eq!(header(&response, "X-RateLimit-Limit"), "60");
        assert_eq!(header(&response, "X-RateLimit-Remaining"), "59");
        assert_eq!(header(&response, "RateLimit-Limit"), "60");
        assert_eq!(header(&response, "RateLimit-Remaining"), "59");
        assert_eq!(header(&response, "RateLimit-Reset"), "1700000060");
    }

    #[tokio::test]
    async fn test_json_too_many_requests() {
        let response = too_many_requests(true, 5, 42, 1042);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "Retry-After"), "42");
        assert_eq!(header(&response, "X-RateLimit-Remaining"), "0");
        assert_eq!(header(&response, "RateLimit-Reset"), "1042");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, serde_json::json!({ "message": "Too Many Requests" }));
    }

    #[tokio::test]
    async fn test_plain_text_too_many_requests() {
        let response = too_many_requests(false, 5, 42, 1042);

        assert_eq!(header(&response, "Content-Type"), "text/plain; charset=utf-8");
        assert_eq!(header(&response, "RateLimit-Limit"), "5");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Too Many Requests");
    }
}
