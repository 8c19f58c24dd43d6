//! Prometheus metrics for observability and monitoring.
//!
//! Every component records through the `metrics` facade; nothing is exported
//! until a binary starts a [`MetricsServer`]. Without one, recording is a no-op.
//!
//! Recorded families:
//! - Gateway proxying (requests, upstream latency)
//! - Circuit breaker state, transitions and rejections
//! - Service registry writes and stale evictions
//! - Event bus publishes, acks and rejects
//!
//! # Example
//!
//! ```rust,no_run
//! use shopmesh_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serves http://0.0.0.0:9090/metrics
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves the scrape endpoint on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP listener.
    ///
    /// Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be configured.
    /// A recorder that is already installed (e.g. in tests) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            // `ExporterError` implements neither `Debug` nor `Display` in 0.15.
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Gateway
    describe_counter!(
        "gateway_requests_total",
        "Proxied requests by service and outcome"
    );
    describe_histogram!(
        "gateway_upstream_duration_seconds",
        "Time spent waiting for the downstream service"
    );

    // Circuit breakers
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open)"
    );

    // Registry
    describe_counter!(
        "registry_writes_total",
        "Registry document replacements by operation"
    );
    describe_counter!(
        "registry_evictions_total",
        "Descriptors evicted by the staleness sweep"
    );

    // Event bus
    describe_counter!(
        "event_bus_messages_published_total",
        "Total number of messages published to event bus"
    );
    describe_counter!(
        "event_bus_publish_errors_total",
        "Total number of publish errors"
    );
    describe_counter!(
        "event_bus_messages_acked_total",
        "Messages processed successfully and acknowledged"
    );
    describe_counter!(
        "event_bus_messages_rejected_total",
        "Messages dropped after a handler failure"
    );
    describe_counter!(
        "event_bus_reconnects_total",
        "Broker reconnect attempts"
    );
}

/// Gateway metrics recorder.
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// Record a proxied request and its upstream latency.
    pub fn record_request(service: &str, outcome: &'static str, duration: Duration) {
        counter!(
            "gateway_requests_total",
            "service" => service.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("gateway_upstream_duration_seconds", "service" => service.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Circuit breaker metrics recorder.
pub struct BreakerMetrics;

impl BreakerMetrics {
    /// Record circuit breaker state.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    pub fn record_state(service: &str, state: f64) {
        gauge!("circuit_breaker_state", "service" => service.to_string()).set(state);
    }

    /// Record a state transition.
    pub fn record_transition(service: &str, from: &'static str, to: &'static str) {
        counter!(
            "circuit_breaker_transitions_total",
            "service" => service.to_string(),
            "from" => from,
            "to" => to
        )
        .increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection(service: &str) {
        counter!("circuit_breaker_rejections_total", "service" => service.to_string())
            .increment(1);
    }
}

/// Registry metrics recorder.
pub struct RegistryMetrics;

impl RegistryMetrics {
    /// Record a document replacement.
    pub fn record_write(operation: &'static str) {
        counter!("registry_writes_total", "operation" => operation).increment(1);
    }

    /// Record stale evictions.
    pub fn record_evictions(count: usize) {
        counter!("registry_evictions_total").increment(count as u64);
    }
}

/// Event bus metrics recorder.
pub struct EventBusMetrics;

impl EventBusMetrics {
    /// Record a message publish.
    pub fn record_publish(routing_key: &str) {
        counter!(
            "event_bus_messages_published_total",
            "routing_key" => routing_key.to_string()
        )
        .increment(1);
    }

    /// Record a publish error.
    pub fn record_publish_error(routing_key: &str) {
        counter!(
            "event_bus_publish_errors_total",
            "routing_key" => routing_key.to_string()
        )
        .increment(1);
    }

    /// Record an acknowledged message.
    pub fn record_ack(queue: &str) {
        counter!("event_bus_messages_acked_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a message dropped after handler failure.
    pub fn record_reject(queue: &str) {
        counter!("event_bus_messages_rejected_total", "queue" => queue.to_string())
            .increment(1);
    }

    /// Record a reconnect attempt.
    pub fn record_reconnect() {
        counter!("event_bus_reconnects_total").increment(1);
    }
}
