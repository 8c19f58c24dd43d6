//! Breaker-guarded request forwarding.
//!
//! Every outbound call the gateway makes for a client (proxied routes and
//! aggregate sub-calls alike) goes through [`Dispatcher::dispatch`]:
//!
//! 1. ask the target's breaker for admission
//! 2. resolve the base URL, static map first, registry second
//! 3. forward with a bounded timeout
//! 4. settle the breaker: transport errors and 5xx are failures
//!
//! Upstream responses, including 4xx and 5xx, are handed back verbatim.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use shopmesh_runtime::circuit_breaker::{CircuitBreakerTable, Permit};
use shopmesh_runtime::metrics::GatewayMetrics;
use shopmesh_runtime::registry::{DiscoveryError, ServiceRegistry};
use shopmesh_web::CorrelationId;
use shopmesh_web::middleware::CORRELATION_ID_HEADER;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::GatewayError;

/// Where a base URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    /// The gateway's static service map
    Static,
    /// Service registry discovery
    Registry,
}

impl AddressSource {
    /// Label used in health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Static => "direct",
            Self::Registry => "registry",
        }
    }
}

/// A resolved base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Base URL without trailing slash
    pub base_url: String,
    /// Where it came from
    pub source: AddressSource,
}

/// An outbound request, already rewritten for the target service.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    method: Method,
    path: String,
    raw_query: Option<String>,
    params: Vec<(String, String)>,
    content_type: Option<HeaderValue>,
    authorization: Option<HeaderValue>,
    correlation_id: Option<Uuid>,
    body: Bytes,
    timeout: Option<Duration>,
}

impl ProxyRequest {
    /// Request for `method path` with no headers or body.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            raw_query: None,
            params: Vec::new(),
            content_type: None,
            authorization: None,
            correlation_id: None,
            body: Bytes::new(),
            timeout: None,
        }
    }

    /// Shorthand for a `GET`.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Forward an inbound request to `path`, keeping its method, query
    /// string, content type, authorization and correlation id.
    #[must_use]
    pub fn forward(parts: &Parts, path: impl Into<String>, body: Bytes) -> Self {
        let mut request = Self::new(parts.method.clone(), path);
        request.raw_query = parts.uri.query().filter(|q| !q.is_empty()).map(ToString::to_string);
        request.content_type = parts.headers.get(header::CONTENT_TYPE).cloned();
        request.authorization = parts.headers.get(header::AUTHORIZATION).cloned().map(sensitive);
        request.correlation_id = parts.extensions.get::<CorrelationId>().map(|id| id.0);
        request.body = body;
        request
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Send `Authorization: <value>` (already including the scheme).
    #[must_use]
    pub fn with_authorization(mut self, value: &str) -> Self {
        self.authorization = HeaderValue::from_str(value).ok().map(sensitive);
        self
    }

    /// Send a JSON body.
    #[must_use]
    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.body = Bytes::from(body.to_string());
        self.content_type = Some(HeaderValue::from_static("application/json"));
        self
    }

    /// Tag the request with a correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Override the dispatcher's default timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Downstream path (without query).
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    fn url(&self, base_url: &str) -> Option<reqwest::Url> {
        let joined = format!("{}{}", base_url.trim_end_matches('/'), self.path);
        let mut url = reqwest::Url::parse(&joined).ok()?;
        url.set_query(self.raw_query.as_deref());
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.params);
        }
        Some(url)
    }
}

/// An upstream response, passed through unchanged.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Upstream status
    pub status: StatusCode,
    /// Upstream content type
    pub content_type: Option<HeaderValue>,
    /// Upstream body
    pub body: Bytes,
}

impl ProxyResponse {
    /// Whether the upstream answered 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the decode error when the body is not the expected JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        if let Some(content_type) = self.content_type {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
        (self.status, headers, Body::from(self.body)).into_response()
    }
}

/// Forwards requests to downstream services through their breakers.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    static_urls: BTreeMap<String, String>,
    registry: Option<Arc<ServiceRegistry>>,
    breakers: Arc<CircuitBreakerTable>,
    timeout: Duration,
}

impl Dispatcher {
    /// Dispatcher over a static service map.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        static_urls: BTreeMap<String, String>,
        breakers: Arc<CircuitBreakerTable>,
    ) -> Self {
        Self {
            client,
            static_urls,
            registry: None,
            breakers,
            timeout: Duration::from_secs(10),
        }
    }

    /// Fall back to registry discovery for services missing from the static map.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Default per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Breaker table.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerTable> {
        &self.breakers
    }

    /// Registry, if discovery is enabled.
    #[must_use]
    pub fn registry(&self) -> Option<&Arc<ServiceRegistry>> {
        self.registry.as_ref()
    }

    /// HTTP client shared by every call.
    #[must_use]
    pub const fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Resolve a service's base URL.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ServiceNotFound`] when neither the static map
    /// nor the registry yields a healthy address, and
    /// [`GatewayError::Registry`] when the registry cannot be read.
    pub async fn resolve(&self, service: &str) -> Result<Resolution, GatewayError> {
        if let Some(url) = self.static_urls.get(service) {
            return Ok(Resolution {
                base_url: url.trim_end_matches('/').to_string(),
                source: AddressSource::Static,
            });
        }

        let Some(registry) = &self.registry else {
            return Err(GatewayError::ServiceNotFound {
                service: service.to_string(),
                reason: "no static mapping and discovery is disabled".to_string(),
            });
        };

        match registry.discover(service).await {
            Ok(descriptor) => Ok(Resolution {
                base_url: descriptor.base_url.trim_end_matches('/').to_string(),
                source: AddressSource::Registry,
            }),
            Err(DiscoveryError::Store(error)) => Err(GatewayError::Registry(error)),
            Err(error) => Err(GatewayError::ServiceNotFound {
                service: service.to_string(),
                reason: error.to_string(),
            }),
        }
    }

    /// Forward `request` to `service`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::CircuitOpen`] when the breaker refuses admission; no
    ///   request is sent
    /// - [`GatewayError::ServiceNotFound`] / [`GatewayError::Registry`] when
    ///   the service cannot be resolved; the breaker is left untouched
    /// - [`GatewayError::Upstream`] when no upstream response was received
    pub async fn dispatch(
        &self,
        service: &str,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, GatewayError> {
        let breaker = self.breakers.get(service);
        let permit = match breaker.as_deref() {
            Some(breaker) => Some(breaker.try_acquire().map_err(|open| {
                GatewayMetrics::record_request(service, "rejected", Duration::ZERO);
                GatewayError::CircuitOpen {
                    service: service.to_string(),
                    state: breaker.state(),
                    retry_after: open.retry_after,
                }
            })?),
            None => None,
        };

        let resolution = self.resolve(service).await.inspect_err(|error| {
            tracing::warn!(service, error = %error, "Could not resolve service");
            GatewayMetrics::record_request(service, "unresolved", Duration::ZERO);
        })?;

        let url = request.url(&resolution.base_url).ok_or_else(|| GatewayError::InvalidTarget {
            service: service.to_string(),
            url: format!("{}{}", resolution.base_url, request.path),
        })?;

        tracing::debug!(
            service,
            method = %request.method,
            url = %url,
            source = resolution.source.as_str(),
            probe = permit.as_ref().is_some_and(Permit::is_probe),
            "Forwarding request"
        );

        self.send(service, url, request, permit).await
    }

    async fn send(
        &self,
        service: &str,
        url: reqwest::Url,
        request: ProxyRequest,
        permit: Option<Permit<'_>>,
    ) -> Result<ProxyResponse, GatewayError> {
        let timeout = request.timeout.unwrap_or(self.timeout);
        let mut builder = self.client.request(request.method, url).timeout(timeout);
        if let Some(content_type) = request.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        if let Some(authorization) = request.authorization {
            builder = builder.header(header::AUTHORIZATION, authorization);
        }
        if let Some(id) = request.correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, id.to_string());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let started = Instant::now();
        let received = match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
                response.bytes().await.map(|body| ProxyResponse {
                    status,
                    content_type,
                    body,
                })
            }
            Err(error) => Err(error),
        };
        let elapsed = started.elapsed();

        match received {
            Ok(response) => {
                let outcome = if response.status.is_server_error() {
                    settle(permit, false);
                    tracing::warn!(
                        service,
                        status = %response.status,
                        "Upstream returned a server error"
                    );
                    "server_error"
                } else {
                    settle(permit, true);
                    if response.status.is_client_error() { "client_error" } else { "success" }
                };
                GatewayMetrics::record_request(service, outcome, elapsed);
                Ok(response)
            }
            Err(error) => {
                settle(permit, false);
                GatewayMetrics::record_request(service, "transport_error", elapsed);
                let reason = if error.is_timeout() {
                    format!("timed out after {}ms", timeout.as_millis())
                } else {
                    error.to_string()
                };
                tracing::warn!(service, error = %reason, "Upstream request failed");
                Err(GatewayError::Upstream {
                    service: service.to_string(),
                    reason,
                })
            }
        }
    }
}

fn sensitive(mut value: HeaderValue) -> HeaderValue {
    value.set_sensitive(true);
    value
}

fn settle(permit: Option<Permit<'_>>, success: bool) {
    match (permit, success) {
        (Some(permit), true) => permit.record_success(),
        (Some(permit), false) => permit.record_failure(),
        (None, _) => {}
    }
}
