//! Proxied routes: rewriting, pass-through and circuit breaking.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use common::{Harness, get, mock};
use serde_json::json;
use shopmesh_core::ServiceRegistration;
use shopmesh_gateway::config::ITEM_SERVICE;
use shopmesh_gateway::{GatewayState, router};
use shopmesh_runtime::circuit_breaker::State;
use shopmesh_runtime::registry::{InMemoryRegistryStore, ServiceRegistry};
use shopmesh_testing::MockService;
use std::sync::Arc;

#[tokio::test]
async fn item_request_is_rewritten_and_returned_unchanged() {
    let item = MockService::builder()
        .route(
            Method::GET,
            "/42",
            StatusCode::OK,
            json!({ "success": true, "data": { "id": "42", "name": "Rice" } }),
        )
        .start()
        .await
        .unwrap();
    let harness = Harness::new(mock().await, mock().await, item).await;

    let (status, headers, body) = harness.get("/api/items/42").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true, "data": { "id": "42", "name": "Rice" } }));
    assert_eq!(headers["x-service"], "api-gateway");
    assert_eq!(harness.item.requests()[0].path, "/42");
    assert_eq!(harness.user.calls() + harness.list.calls(), 0);
}

#[tokio::test]
async fn query_string_is_forwarded() {
    let harness = Harness::new(mock().await, mock().await, mock().await).await;

    harness.get("/api/items/search?q=milk&limit=3").await;

    assert_eq!(harness.item.requests()[0].path, "/search?q=milk&limit=3");
}

#[tokio::test]
async fn method_body_and_authorization_are_forwarded() {
    let list = MockService::builder()
        .route(Method::POST, "/", StatusCode::CREATED, json!({ "success": true }))
        .start()
        .await
        .unwrap();
    let harness = Harness::new(mock().await, list, mock().await).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/lists")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer t0k3n")
        .header("x-internal-secret", "do-not-forward")
        .body(Body::from(json!({ "name": "Weekly" }).to_string()))
        .unwrap();
    let (status, _, _) = harness.send(request).await;

    assert_eq!(status, StatusCode::CREATED);
    let forwarded = &harness.list.requests()[0];
    assert_eq!(forwarded.method, Method::POST);
    assert_eq!(forwarded.path, "/");
    assert_eq!(forwarded.authorization(), Some("Bearer t0k3n"));
    assert_eq!(forwarded.json(), json!({ "name": "Weekly" }));
    assert!(forwarded.header("x-internal-secret").is_none());
    assert!(forwarded.header("x-correlation-id").is_some());
}

#[tokio::test]
async fn auth_routes_keep_their_prefix() {
    let harness = Harness::new(mock().await, mock().await, mock().await).await;

    harness.get("/api/auth/validate").await;
    harness.get("/api/users/7").await;

    let paths: Vec<String> = harness.user.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, ["/auth/validate", "/users/7"]);
}

#[tokio::test]
async fn upstream_errors_are_passed_through_verbatim() {
    let item = MockService::builder()
        .fallback(StatusCode::NOT_FOUND, json!({ "success": false, "message": "Item not found" }))
        .start()
        .await
        .unwrap();
    let harness = Harness::new(mock().await, mock().await, item).await;

    let (status, _, body) = harness.get("/api/items/missing").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "success": false, "message": "Item not found" }));
}

#[tokio::test]
async fn client_errors_do_not_open_the_breaker() {
    let harness = Harness::new(mock().await, mock().await, mock().await).await;

    for _ in 0..5 {
        let (status, _, _) = harness.get("/api/items/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    let breaker = harness.state.dispatcher().breakers().get(ITEM_SERVICE).unwrap();
    assert_eq!(breaker.state(), State::Closed);
    assert_eq!(harness.item.calls(), 5);
}

#[tokio::test]
async fn breaker_opens_after_three_failures_and_stops_calling() {
    let item = MockService::builder()
        .fallback(StatusCode::INTERNAL_SERVER_ERROR, json!({ "success": false, "message": "boom" }))
        .start()
        .await
        .unwrap();
    let harness = Harness::new(mock().await, mock().await, item).await;

    for _ in 0..3 {
        let (status, _, body) = harness.get("/api/items/42").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "boom");
    }
    assert_eq!(harness.item.calls(), 3);

    let (status, headers, body) = harness.get("/api/items/42").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["circuitBreaker"], "OPEN");
    assert_eq!(body["service"], ITEM_SERVICE);
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=30).contains(&retry_after));
    assert_eq!(harness.item.calls(), 3, "an open breaker must not call the service");
}

#[tokio::test]
async fn unreachable_service_is_503_and_counts_as_failure() {
    let down = MockService::unreachable_url().await.unwrap();
    let user = mock().await;
    let list = mock().await;
    let config = common::config(&user.base_url(), &list.base_url(), &down);
    let state = GatewayState::new(&config, None).unwrap();

    let (status, _, body) = common::send(router(state.clone()), get("/api/items/42")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
    assert_eq!(body["service"], ITEM_SERVICE);
    let snapshot = state.dispatcher().breakers().snapshot();
    assert_eq!(snapshot[ITEM_SERVICE].consecutive_failures, 1);
}

#[tokio::test]
async fn registry_is_consulted_when_no_static_mapping_exists() {
    let item = MockService::builder()
        .route(Method::GET, "/42", StatusCode::OK, json!({ "success": true }))
        .start()
        .await
        .unwrap();
    let registry = Arc::new(ServiceRegistry::new(Arc::new(InMemoryRegistryStore::new())));
    registry
        .register(ITEM_SERVICE, ServiceRegistration::new(item.base_url()))
        .await
        .unwrap();

    let user = mock().await;
    let list = mock().await;
    let mut config = common::config(&user.base_url(), &list.base_url(), "unused");
    config.services.remove(ITEM_SERVICE);
    let state = GatewayState::new(&config, Some(Arc::clone(&registry))).unwrap();

    let (status, _, _) = common::send(router(state.clone()), get("/api/items/42")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item.calls(), 1);

    registry.update_health(ITEM_SERVICE, false).await.unwrap();
    let (status, _, body) = common::send(router(state.clone()), get("/api/items/42")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["message"], "Service item-service not found");
    assert_eq!(item.calls(), 1);

    let snapshot = state.dispatcher().breakers().snapshot();
    assert_eq!(snapshot[ITEM_SERVICE].consecutive_failures, 0);
}

#[tokio::test]
async fn unknown_paths_are_gateway_404s() {
    let harness = Harness::new(mock().await, mock().await, mock().await).await;

    let (status, headers, body) = harness.get("/api/carts/1").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["service"], "api-gateway");
    assert_eq!(headers["x-service-version"], "1.0.0");
    assert_eq!(harness.total_calls(), 0);
}
