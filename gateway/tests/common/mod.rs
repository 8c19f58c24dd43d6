//! Shared fixtures: a gateway wired to loopback mock services.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use shopmesh_gateway::config::{ITEM_SERVICE, LIST_SERVICE, USER_SERVICE};
use shopmesh_gateway::{GatewayConfig, GatewayState, router};
use shopmesh_runtime::registry::ServiceRegistry;
use shopmesh_testing::MockService;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Gateway config pointing the three services at the given base URLs.
pub fn config(user: &str, list: &str, item: &str) -> GatewayConfig {
    GatewayConfig {
        services: BTreeMap::from([
            (USER_SERVICE.to_string(), user.to_string()),
            (LIST_SERVICE.to_string(), list.to_string()),
            (ITEM_SERVICE.to_string(), item.to_string()),
        ]),
        proxy_timeout: Duration::from_secs(2),
        health_timeout: Duration::from_secs(1),
        aggregate_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    }
}

/// Three downstream mocks plus the gateway in front of them.
pub struct Harness {
    pub user: MockService,
    pub list: MockService,
    pub item: MockService,
    pub state: GatewayState,
}

impl Harness {
    pub async fn new(user: MockService, list: MockService, item: MockService) -> Self {
        Self::with_registry(user, list, item, None).await
    }

    pub async fn with_registry(
        user: MockService,
        list: MockService,
        item: MockService,
        registry: Option<Arc<ServiceRegistry>>,
    ) -> Self {
        let config = config(&user.base_url(), &list.base_url(), &item.base_url());
        let state = GatewayState::new(&config, registry).unwrap();
        Self { user, list, item, state }
    }

    pub fn app(&self) -> Router {
        router(self.state.clone())
    }

    pub fn total_calls(&self) -> usize {
        self.user.calls() + self.list.calls() + self.item.calls()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, serde_json::Value) {
        send(self.app(), request).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, serde_json::Value) {
        self.send(get(uri)).await
    }
}

pub async fn mock() -> MockService {
    MockService::builder().start().await.unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_with_token(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(
    app: Router,
    request: Request<Body>,
) -> (StatusCode, HeaderMap, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("gateway responses are JSON")
    };
    (status, headers, body)
}
