//! Request input lookup for the account tier.

use crate::error::{ThrottleError, ThrottleResult};
use axum::body::{to_bytes, Body, Bytes};
use axum::extract::Request;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::HeaderMap;
use serde_json::Value;
use url::form_urlencoded;

/// Largest body buffered while looking for an input field.
pub const MAX_INPUT_BODY_BYTES: usize = 64 * 1024;

/// Find the string value of `field` in the request body, then in the query
/// string.
///
/// The body is buffered to read it, so the request is handed back rebuilt
/// with the same bytes for the downstream handler.
pub async fn extract_field(request: Request, field: &str) -> ThrottleResult<(Request, Option<String>)> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_INPUT_BODY_BYTES)
        .await
        .map_err(|e| ThrottleError::Body(e.to_string()))?;

    let value = body_field(&parts.headers, &bytes, field)
        .or_else(|| parts.uri.query().and_then(|query| form_field(query.as_bytes(), field)));

    Ok((Request::from_parts(parts, Body::from(bytes)), value))
}

/// Whether the client asked for a JSON response.
pub fn wants_json(request: &Request) -> bool {
    request
        .headers()
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("/json") || accept.contains("+json"))
        .unwrap_or(false)
}

fn body_field(headers: &HeaderMap, bytes: &Bytes, field: &str) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.contains("json") {
        serde_json::from_slice::<Value>(bytes)
            .ok()?
            .get(field)?
            .as_str()
            .map(str::to_string)
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        form_field(bytes, field)
    } else {
        None
    }
}

fn form_field(input: &[u8], field: &str) -> Option<String> {
    form_urlencoded::parse(input)
        .find(|(name, _)| name == field)
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn post(uri: &str, content_type: Option<&'static str>, body: &'static str) -> Request {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .unwrap();
        if let Some(content_type) = content_type {
            request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        request
    }

    #[tokio::test]
    async fn test_reads_json_body_field() {
        let request = post(
            "/login",
            Some("application/json"),
            r#"{"email":"user@example.com","password":"secret"}"#,
        );

        let (request, value) = extract_field(request, "email").await.unwrap();
        assert_eq!(value.as_deref(), Some("user@example.com"));

        let body = to_bytes(request.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"email":"user@example.com","password":"secret"}"#);
    }

    #[tokio::test]
    async fn test_reads_form_body_field() {
        let request = post(
            "/login",
            Some("application/x-www-form-urlencoded; charset=utf-8"),
            "email=user%40example.com&password=secret",
        );

        let (_, value) = extract_field(request, "email").await.unwrap();
        assert_eq!(value.as_deref(), Some("user@example.com"));
    }

    #[tokio::test]
    async fn test_body_wins_over_query() {
        let request = post(
            "/login?email=query@example.com",
            Some("application/json"),
            r#"{"email":"body@example.com"}"#,
        );

        let (_, value) = extract_field(request, "email").await.unwrap();
        assert_eq!(value.as_deref(), Some("body@example.com"));
    }

    #[tokio::test]
    async fn test_falls_back_to_query() {
        let request = post("/login?email=query%40example.com", None, "");

        let (_, value) = extract_field(request, "email").await.unwrap();
        assert_eq!(value.as_deref(), Some("query@example.com"));
    }

    #[tokio::test]
    async fn test_non_string_values_are_absent() {
        let request = post("/login", Some("application/json"), r#"{"email":42}"#);
        let (_, value) = extract_field(request, "email").await.unwrap();
        assert_eq!(value, None);

        let request = post("/login", Some("application/json"), "not json");
        let (_, value) = extract_field(request, "email").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let body = "a".repeat(MAX_INPUT_BODY_BYTES + 1);
        let request = Request::builder()
            .method("POST")
            .uri("/login")
            .body(Body::from(body))
            .unwrap();

        let err = extract_field(request, "email").await.err().unwrap();
        assert!(matches!(err, ThrottleError::Body(_)));
    }

    #[test]
    fn test_wants_json() {
        let mut request = Request::new(Body::empty());
        assert!(!wants_json(&request));

        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("application/vnd.api+json"));
        assert!(wants_json(&request));

        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static("text/html"));
        assert!(!wants_json(&request));
    }
}
