//! The gateway's axum application.
//!
//! Fixed endpoints are mounted explicitly; everything else falls through to
//! [`proxy`], which consults the [`RouteTable`] and answers 404 for paths no
//! prefix claims.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Query, Request, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use shopmesh_runtime::circuit_breaker::CircuitBreakerTable;
use shopmesh_runtime::registry::ServiceRegistry;
use shopmesh_web::{
    AppError, BearerToken, CorrelationId, ServiceInfo, WebResult, correlation_id_layer,
    service_headers_layer,
};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::aggregate::{Aggregator, SearchInfo};
use crate::config::{GATEWAY_SERVICE, GATEWAY_VERSION, GatewayConfig};
use crate::dispatch::{Dispatcher, ProxyRequest};
use crate::health::HealthProber;
use crate::routes::RouteTable;

/// Largest request body the gateway accepts.
pub const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct GatewayState {
    info: Arc<ServiceInfo>,
    routes: Arc<RouteTable>,
    dispatcher: Arc<Dispatcher>,
    aggregator: Arc<Aggregator>,
    prober: Arc<HealthProber>,
}

impl GatewayState {
    /// Wire the gateway from its configuration.
    ///
    /// One breaker is created for every service named by the route table or
    /// the static map.
    ///
    /// # Errors
    ///
    /// Returns the client error if the HTTP client cannot be built.
    pub fn new(
        config: &GatewayConfig,
        registry: Option<Arc<ServiceRegistry>>,
    ) -> Result<Self, reqwest::Error> {
        let routes = RouteTable::default();
        let client = reqwest::Client::builder().build()?;

        let mut services: Vec<String> = routes
            .services()
            .into_iter()
            .map(ToString::to_string)
            .collect();
        services.extend(config.services.keys().cloned());
        let breakers = Arc::new(CircuitBreakerTable::new(services, config.breaker_config()));

        let mut dispatcher = Dispatcher::new(client, config.services.clone(), breakers)
            .with_timeout(config.proxy_timeout);
        if let Some(registry) = registry {
            dispatcher = dispatcher.with_registry(registry);
        }
        let dispatcher = Arc::new(dispatcher);

        Ok(Self {
            info: Arc::new(ServiceInfo::new(GATEWAY_SERVICE, GATEWAY_VERSION)),
            routes: Arc::new(routes),
            aggregator: Arc::new(Aggregator::new(
                Arc::clone(&dispatcher),
                config.aggregate_timeout,
            )),
            prober: Arc::new(HealthProber::new(Arc::clone(&dispatcher), config.health_timeout)),
            dispatcher,
        })
    }

    /// Request dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Health prober, e.g. for the background monitor.
    #[must_use]
    pub fn prober(&self) -> &Arc<HealthProber> {
        &self.prober
    }
}

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/registry", get(registry))
        .route("/circuit-breaker/reset", post(reset_breaker))
        .route("/api/dashboard", get(dashboard))
        .route("/api/search", get(search))
        .fallback(proxy)
        .with_state(state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .layer(service_headers_layer(GATEWAY_SERVICE, GATEWAY_VERSION))
        .layer(correlation_id_layer())
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "Handler panicked");
    AppError::internal("Internal gateway error")
        .with_service(GATEWAY_SERVICE)
        .into_response()
}

#[allow(clippy::unused_async)]
async fn index(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let mut endpoints = vec![
        "GET /health - Service status".to_string(),
        "GET /registry - Registered services".to_string(),
        "POST /circuit-breaker/reset - Close a circuit breaker".to_string(),
        "GET /api/dashboard - User dashboard".to_string(),
        "GET /api/search - Global search".to_string(),
    ];
    endpoints.extend(
        state
            .routes
            .routes()
            .iter()
            .map(|route| format!("{}/* - {}", route.prefix, route.service)),
    );

    Json(json!({
        "service": "API Gateway",
        "version": GATEWAY_VERSION,
        "description": "Gateway for the shopping list microservices",
        "endpoints": endpoints,
    }))
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.prober.report(&state.info).await)
}

async fn registry(State(state): State<GatewayState>) -> WebResult<Json<serde_json::Value>> {
    let document = match state.dispatcher.registry() {
        Some(registry) => registry.list().await.map_err(|error| {
            AppError::internal("Failed to read service registry").with_source(error.into())
        })?,
        None => shopmesh_core::RegistryDocument::new(),
    };

    Ok(Json(json!({
        "success": true,
        "count": document.len(),
        "data": document,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetRequest {
    service_name: String,
}

#[allow(clippy::unused_async)]
async fn reset_breaker(
    State(state): State<GatewayState>,
    payload: Result<Json<ResetRequest>, JsonRejection>,
) -> WebResult<Json<serde_json::Value>> {
    let Json(request) = payload.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let breakers = state.dispatcher.breakers();

    if !breakers.reset(&request.service_name) {
        return Err(AppError::not_found(format!(
            "No circuit breaker for service {}",
            request.service_name
        )));
    }

    tracing::info!(service = %request.service_name, "Circuit breaker reset");
    Ok(Json(json!({
        "success": true,
        "message": format!("Circuit breaker for {} reset", request.service_name),
        "data": breakers.get(&request.service_name).map(|b| b.snapshot()),
    })))
}

async fn dashboard(
    State(state): State<GatewayState>,
    correlation_id: CorrelationId,
    token: BearerToken,
) -> WebResult<Json<serde_json::Value>> {
    let dashboard = state.aggregator.dashboard(&token, correlation_id).await?;
    Ok(Json(json!({ "success": true, "data": dashboard })))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

async fn search(
    State(state): State<GatewayState>,
    correlation_id: CorrelationId,
    token: Option<BearerToken>,
    Query(params): Query<SearchParams>,
) -> WebResult<Json<serde_json::Value>> {
    let query = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("Search query (q) is required"))?;

    let results = state.aggregator.search(&query, token.as_ref(), correlation_id).await;
    Ok(Json(json!({
        "success": true,
        "data": results,
        "search": SearchInfo {
            query,
            timestamp: chrono::Utc::now(),
        },
    })))
}

async fn proxy(State(state): State<GatewayState>, request: Request) -> WebResult<Response> {
    let (parts, body) = request.into_parts();
    let Some(target) = state.routes.resolve(parts.uri.path()) else {
        return Err(AppError::not_found("Endpoint not found").with_service(GATEWAY_SERVICE));
    };

    let body: Bytes = axum::body::to_bytes(body, BODY_LIMIT).await.map_err(|_| {
        AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large", "PAYLOAD_TOO_LARGE")
    })?;

    let service = target.service;
    let response = state
        .dispatcher
        .dispatch(service, ProxyRequest::forward(&parts, target.path, body))
        .await?;
    Ok(response.into_response())
}
