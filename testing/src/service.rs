//! Loopback HTTP servers standing in for downstream services.
//!
//! Each [`MockService`] is a real axum server on `127.0.0.1:0`, so the code
//! under test exercises its actual HTTP client, timeouts included. Every
//! request is recorded; [`MockService::calls`] is the call counter used to
//! assert that a rejected request never left the gateway.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct MockResponse {
    status: StatusCode,
    body: serde_json::Value,
}

/// One request received by a [`MockService`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method
    pub method: Method,
    /// Path including the query string
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Bytes,
}

impl RecordedRequest {
    /// The `Authorization` header, if any.
    #[must_use]
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
    }

    /// A header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The body parsed as JSON (`Null` if empty or invalid).
    #[must_use]
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or_default()
    }
}

struct MockState {
    routes: Mutex<HashMap<(Method, String), MockResponse>>,
    fallback: Mutex<MockResponse>,
    delay: Option<Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Builder for [`MockService`].
#[derive(Debug)]
pub struct MockServiceBuilder {
    routes: HashMap<(Method, String), MockResponse>,
    fallback: MockResponse,
    delay: Option<Duration>,
}

impl MockServiceBuilder {
    /// Answer `method path` with `status` and a JSON body.
    ///
    /// `path` is matched against the path plus query first, then the bare
    /// path.
    #[must_use]
    pub fn route(
        mut self,
        method: Method,
        path: impl Into<String>,
        status: StatusCode,
        body: serde_json::Value,
    ) -> Self {
        self.routes
            .insert((method, path.into()), MockResponse { status, body });
        self
    }

    /// Response for requests matching no route (default: 404).
    #[must_use]
    pub fn fallback(mut self, status: StatusCode, body: serde_json::Value) -> Self {
        self.fallback = MockResponse { status, body };
        self
    }

    /// Delay every response, e.g. to trip a client timeout.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Bind a loopback port and start serving.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if no loopback port can be bound.
    pub async fn start(self) -> std::io::Result<MockService> {
        let state = Arc::new(MockState {
            routes: Mutex::new(self.routes),
            fallback: Mutex::new(self.fallback),
            delay: self.delay,
            requests: Mutex::new(Vec::new()),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = Router::new().fallback(respond).with_state(Arc::clone(&state));

        let task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app).await {
                tracing::error!(error = %error, "Mock service stopped");
            }
        });

        Ok(MockService { addr, state, task })
    }
}

async fn respond(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);

    state.requests.lock().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        headers,
        body,
    });

    if let Some(delay) = state.delay {
        tokio::time::sleep(delay).await;
    }

    let response = {
        let routes = state.routes.lock();
        routes
            .get(&(method.clone(), path))
            .or_else(|| routes.get(&(method, uri.path().to_string())))
            .cloned()
    }
    .unwrap_or_else(|| state.fallback.lock().clone());

    (response.status, axum::Json(response.body)).into_response()
}

/// A running downstream mock. Stops serving when dropped.
pub struct MockService {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for MockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockService")
            .field("addr", &self.addr)
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl MockService {
    /// Start building a mock.
    #[must_use]
    pub fn builder() -> MockServiceBuilder {
        MockServiceBuilder {
            routes: HashMap::new(),
            fallback: MockResponse {
                status: StatusCode::NOT_FOUND,
                body: serde_json::json!({"success": false, "message": "not mocked"}),
            },
            delay: None,
        }
    }

    /// `http://127.0.0.1:<port>`
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of requests received.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.state.requests.lock().len()
    }

    /// Every request received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Replace or add a route while running.
    pub fn set_route(
        &self,
        method: Method,
        path: impl Into<String>,
        status: StatusCode,
        body: serde_json::Value,
    ) {
        self.state
            .routes
            .lock()
            .insert((method, path.into()), MockResponse { status, body });
    }

    /// Replace the fallback response while running.
    pub fn set_fallback(&self, status: StatusCode, body: serde_json::Value) {
        *self.state.fallback.lock() = MockResponse { status, body };
    }

    /// A loopback URL with nothing listening, for connection-refused cases.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if no loopback port can be bound.
    pub async fn unreachable_url() -> std::io::Result<String> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);
        Ok(format!("http://{addr}"))
    }
}

impl Drop for MockService {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn answers_routes_and_records_requests() -> anyhow::Result<()> {
        let mock = MockService::builder()
            .route(Method::GET, "/42", StatusCode::OK, json!({"id": "42"}))
            .start()
            .await?;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("{}/42", mock.base_url()))
            .header("authorization", "Bearer t")
            .send()
            .await?;
        assert_eq!(response.status(), 200);
        assert_eq!(response.json::<serde_json::Value>().await?, json!({"id": "42"}));

        let missing = client.get(format!("{}/nope", mock.base_url())).send().await?;
        assert_eq!(missing.status(), 404);

        assert_eq!(mock.calls(), 2);
        let first = &mock.requests()[0];
        assert_eq!(first.path, "/42");
        assert_eq!(first.authorization(), Some("Bearer t"));
        Ok(())
    }

    #[tokio::test]
    async fn query_specific_routes_win_over_bare_paths() -> anyhow::Result<()> {
        let mock = MockService::builder()
            .route(Method::GET, "/", StatusCode::OK, json!("bare"))
            .route(Method::GET, "/?active=true", StatusCode::OK, json!("query"))
            .start()
            .await?;
        let client = reqwest::Client::new();

        let body: serde_json::Value = client
            .get(format!("{}/?active=true", mock.base_url()))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(body, json!("query"));

        let body: serde_json::Value = client
            .get(format!("{}/?other=1", mock.base_url()))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(body, json!("bare"));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_url_refuses_connections() {
        let url = MockService::unreachable_url().await.unwrap();
        assert!(reqwest::get(url).await.is_err());
    }
}
