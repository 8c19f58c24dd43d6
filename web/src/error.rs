//! Error types for web handlers.
//!
//! [`AppError`] is the one error every shopmesh HTTP surface returns. It
//! renders as
//!
//! ```json
//! { "success": false, "code": "SERVICE_UNAVAILABLE", "message": "...", "service": "item-service" }
//! ```
//!
//! plus any extra detail fields, and sets `Retry-After` when a retry hint is
//! attached.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::fmt;
use std::time::Duration;

/// Application error type for web handlers.
///
/// # Examples
///
/// ```
/// use shopmesh_web::AppError;
/// use std::time::Duration;
///
/// let error = AppError::unavailable("Circuit breaker is open")
///     .with_service("item-service")
///     .with_detail("circuitBreaker", "OPEN")
///     .with_retry_after(Duration::from_secs(12));
///
/// assert_eq!(error.status().as_u16(), 503);
/// ```
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: String,
    service: Option<String>,
    details: serde_json::Map<String, serde_json::Value>,
    retry_after: Option<Duration>,
    /// Internal error (logged, never exposed)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: code.into(),
            service: None,
            details: serde_json::Map::new(),
            retry_after: None,
            source: None,
        }
    }

    /// Attach the internal cause.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Tag the error with the service it concerns.
    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Add a field to the JSON body.
    #[must_use]
    pub fn with_detail(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Set a `Retry-After` hint (rounded up to whole seconds, at least 1).
    #[must_use]
    pub const fn with_retry_after(mut self, after: Duration) -> Self {
        self.retry_after = Some(after);
        self
    }

    /// HTTP status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// User-facing message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "BAD_REQUEST")
    }

    /// Create a 401 Unauthorized error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message, "UNAUTHORIZED")
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message, "NOT_FOUND")
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, "INTERNAL_SERVER_ERROR")
    }

    /// Create a 503 Service Unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message, "SERVICE_UNAVAILABLE")
    }

    fn retry_after_header(&self) -> Option<HeaderValue> {
        let after = self.retry_after?;
        let mut secs = after.as_secs();
        if after.subsec_nanos() > 0 {
            secs += 1;
        }
        Some(HeaderValue::from(secs.max(1)))
    }

    fn body(&self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("success".to_string(), false.into());
        body.insert("code".to_string(), self.code.clone().into());
        body.insert("message".to_string(), self.message.clone().into());
        if let Some(service) = &self.service {
            body.insert("service".to_string(), service.clone().into());
        }
        for (key, value) in &self.details {
            body.entry(key.clone()).or_insert_with(|| value.clone());
        }
        serde_json::Value::Object(body)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    service = self.service.as_deref(),
                    message = %self.message,
                    error = %source,
                    "Request failed"
                ),
                None => tracing::warn!(
                    status = %self.status,
                    code = %self.code,
                    service = self.service.as_deref(),
                    message = %self.message,
                    "Request failed"
                ),
            }
        }

        let retry_after = self.retry_after_header();
        let mut response = (self.status, Json(self.body())).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

/// Convert `anyhow::Error` to `AppError`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn render(error: AppError) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_error_display() {
        let err = AppError::bad_request("Search query is required");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Search query is required");
    }

    #[tokio::test]
    async fn body_carries_service_and_details() {
        let (status, _, body) = render(
            AppError::unavailable("Service temporarily unavailable")
                .with_service("list-service")
                .with_detail("circuitBreaker", "OPEN"),
        )
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body,
            serde_json::json!({
                "success": false,
                "code": "SERVICE_UNAVAILABLE",
                "message": "Service temporarily unavailable",
                "service": "list-service",
                "circuitBreaker": "OPEN",
            })
        );
    }

    #[tokio::test]
    async fn details_cannot_override_standard_fields() {
        let (_, _, body) =
            render(AppError::unauthorized("nope").with_detail("success", true)).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn retry_after_rounds_up_to_whole_seconds() {
        let open = AppError::unavailable("open").with_retry_after(Duration::from_millis(12_300));
        let (_, headers, _) = render(open).await;
        assert_eq!(headers[header::RETRY_AFTER], "13");

        let (_, headers, _) =
            render(AppError::unavailable("open").with_retry_after(Duration::ZERO)).await;
        assert_eq!(headers[header::RETRY_AFTER], "1");

        let (_, headers, _) = render(AppError::not_found("gone")).await;
        assert!(headers.get(header::RETRY_AFTER).is_none());
    }
}
