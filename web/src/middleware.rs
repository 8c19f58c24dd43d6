//! Axum middleware for request tracking and service identification.
//!
//! - **Correlation ID tracking**: extract or generate an ID per request, store
//!   it in the request extensions, echo it in the response
//! - **Service headers**: stamp every response with `X-Service` and
//!   `X-Service-Version`
//!
//! # Example
//!
//! ```
//! use axum::{Router, routing::get};
//! use shopmesh_web::middleware::{correlation_id_layer, service_headers_layer};
//!
//! let app: Router = Router::new()
//!     .route("/health", get(|| async { "ok" }))
//!     .layer(service_headers_layer("api-gateway", "1.0.0"))
//!     .layer(correlation_id_layer());
//! ```

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    response::Response,
};
use futures::future::BoxFuture;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

use crate::extractors::CorrelationId;

/// Header name for correlation ID.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Header naming the service that produced a response.
pub const SERVICE_HEADER: &str = "X-Service";

/// Header carrying the producing service's version.
pub const SERVICE_VERSION_HEADER: &str = "X-Service-Version";

/// Create a layer that adds correlation ID tracking to all requests.
///
/// A valid UUID in `X-Correlation-ID` is kept; anything else is replaced by a
/// fresh v4. The request runs inside an `http_request` span carrying the ID.
#[must_use]
pub const fn correlation_id_layer() -> CorrelationIdLayer {
    CorrelationIdLayer
}

/// Layer for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdLayer;

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdMiddleware { inner }
    }
}

/// Middleware service for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdMiddleware<S> {
    inner: S,
}

impl<S> Service<Request> for CorrelationIdMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        req.extensions_mut().insert(CorrelationId(correlation_id));

        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %req.method(),
            uri = %req.uri(),
        );

        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.instrument(span).await?;

            if let Ok(header_value) = HeaderValue::from_str(&correlation_id.to_string()) {
                response
                    .headers_mut()
                    .insert(CORRELATION_ID_HEADER, header_value);
            }

            Ok(response)
        })
    }
}

/// Extension trait for reading the correlation ID stored by the middleware.
pub trait CorrelationIdExt {
    /// The correlation ID, if [`correlation_id_layer`] ran.
    fn correlation_id(&self) -> Option<Uuid>;
}

impl<B> CorrelationIdExt for axum::http::Request<B> {
    fn correlation_id(&self) -> Option<Uuid> {
        self.extensions().get::<CorrelationId>().map(|id| id.0)
    }
}

/// Create a layer that stamps `X-Service` and `X-Service-Version` on every
/// response.
///
/// Values that are not valid header text are replaced by `unknown`.
#[must_use]
pub fn service_headers_layer(service: &str, version: &str) -> ServiceHeadersLayer {
    let value = |raw: &str| {
        HeaderValue::from_str(raw).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
    };
    ServiceHeadersLayer {
        service: value(service),
        version: value(version),
    }
}

/// Layer adding service identification headers.
#[derive(Clone, Debug)]
pub struct ServiceHeadersLayer {
    service: HeaderValue,
    version: HeaderValue,
}

impl<S> Layer<S> for ServiceHeadersLayer {
    type Service = ServiceHeadersMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceHeadersMiddleware {
            inner,
            service: self.service.clone(),
            version: self.version.clone(),
        }
    }
}

/// Middleware service adding service identification headers.
#[derive(Clone, Debug)]
pub struct ServiceHeadersMiddleware<S> {
    inner: S,
    service: HeaderValue,
    version: HeaderValue,
}

impl<S> Service<Request> for ServiceHeadersMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let service = self.service.clone();
        let version = self.version.clone();
        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.await?;
            let headers = response.headers_mut();
            headers.insert(HeaderName::from_static("x-service"), service);
            headers.insert(HeaderName::from_static("x-service-version"), version);
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/test",
                get(|req: Request<Body>| async move {
                    req.correlation_id().map(|id| id.to_string()).unwrap_or_default()
                }),
            )
            .layer(service_headers_layer("api-gateway", "1.0.0"))
            .layer(correlation_id_layer())
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_correlation_id_generated_if_missing() {
        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();

        let response = app().oneshot(request).await.unwrap();

        let correlation_id = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .expect("Correlation ID header should be present")
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&correlation_id).is_ok());
        assert_eq!(body_text(response).await, correlation_id);
    }

    #[tokio::test]
    async fn test_correlation_id_preserved_from_request() {
        let request_uuid = Uuid::new_v4();
        let request = Request::builder()
            .uri("/test")
            .header(CORRELATION_ID_HEADER, request_uuid.to_string())
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(
            response.headers()[CORRELATION_ID_HEADER],
            request_uuid.to_string().as_str()
        );
    }

    #[tokio::test]
    async fn test_invalid_uuid_generates_new() {
        let request = Request::builder()
            .uri("/test")
            .header(CORRELATION_ID_HEADER, "not-a-uuid")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();

        let correlation_id = response.headers()[CORRELATION_ID_HEADER].to_str().unwrap();
        assert!(Uuid::parse_str(correlation_id).is_ok());
    }

    #[tokio::test]
    async fn service_headers_are_added_to_responses() {
        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();

        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()[SERVICE_HEADER], "api-gateway");
        assert_eq!(response.headers()[SERVICE_VERSION_HEADER], "1.0.0");
    }
}
