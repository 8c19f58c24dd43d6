//! Consumer plumbing and HTTP surface shared by the checkout workers.

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::get,
};
use futures::future::BoxFuture;
use serde_json::json;
use shopmesh_amqp::AmqpEventBus;
use shopmesh_core::ServiceRegistration;
use shopmesh_core::event::{CHECKOUT_PATTERN, CheckoutEvent, SHOPPING_EXCHANGE};
use shopmesh_core::event_bus::{EventBus, MessageHandler, QueueBinding, message_handler};
use shopmesh_runtime::health::HealthCheck;
use shopmesh_runtime::registry::{FileRegistryStore, RegistryHeartbeat, ServiceRegistry};
use shopmesh_runtime::retry::{RetryPolicy, retry_until_ok};
use shopmesh_web::handlers::health_report;
use shopmesh_web::{ServiceInfo, correlation_id_layer, service_headers_layer, shutdown_signal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::WorkerConfig;

/// Version the workers report.
pub const WORKER_VERSION: &str = "1.0.0";

/// What a consumer did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// First delivery for this list; side effects applied
    Processed,
    /// The list was already handled; nothing done
    Duplicate,
}

/// A consumer of decoded checkout events.
///
/// Deliveries are at-least-once; implementations use
/// [`CheckoutEvent::list_id`] to make redeliveries harmless.
pub trait CheckoutConsumer: Send + Sync + 'static {
    /// Apply `event`.
    ///
    /// # Errors
    ///
    /// An error drops the message; it is not redelivered.
    fn handle<'a>(&'a self, event: &'a CheckoutEvent) -> BoxFuture<'a, anyhow::Result<Delivery>>;
}

/// Binding of `queue` to every checkout sub-event.
#[must_use]
pub fn checkout_binding(queue: &str) -> QueueBinding {
    QueueBinding::new(queue, SHOPPING_EXCHANGE, CHECKOUT_PATTERN)
}

/// Adapt `consumer` to the bus: decode the JSON body, then hand it over.
///
/// A body that is not a checkout event fails the delivery.
pub fn checkout_handler<C: CheckoutConsumer>(consumer: Arc<C>) -> MessageHandler {
    message_handler(move |body| {
        let consumer = Arc::clone(&consumer);
        async move {
            let event: CheckoutEvent =
                serde_json::from_value(body).context("message is not a checkout event")?;
            if consumer.handle(&event).await? == Delivery::Duplicate {
                tracing::debug!(list_id = %event.list_id(), "Duplicate checkout skipped");
            }
            Ok(())
        }
    })
}

/// Whether a worker's consumer is attached to its queue.
#[derive(Debug, Clone)]
pub struct ConsumerStatus {
    queue: String,
    active: Arc<AtomicBool>,
}

impl ConsumerStatus {
    /// Inactive status for `queue`.
    #[must_use]
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue being consumed.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether the consumer is registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn mark_active(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Health check entry for the consumer.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        let component = format!("consumer:{}", self.queue);
        if self.is_active() {
            HealthCheck::healthy(component)
        } else {
            HealthCheck::unhealthy(component, "not subscribed yet")
        }
    }
}

/// Start consuming `binding` in the background, retrying setup every
/// `retry_delay` until the broker accepts the consumer.
pub fn subscribe_with_retry(
    bus: Arc<dyn EventBus>,
    binding: QueueBinding,
    handler: MessageHandler,
    retry_delay: Duration,
    status: ConsumerStatus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let policy = RetryPolicy::fixed(retry_delay);
        retry_until_ok(&policy, || bus.consume(&binding, Arc::clone(&handler))).await;

        status.mark_active();
        tracing::info!(
            queue = %binding.queue_name,
            pattern = %binding.routing_key_pattern,
            "Consumer started"
        );
    })
}

/// Identity and consumer status behind a worker's HTTP routes.
#[derive(Debug, Clone)]
pub struct WorkerState {
    info: Arc<ServiceInfo>,
    consumer: ConsumerStatus,
}

impl WorkerState {
    /// State for a worker named by `info` consuming through `consumer`.
    #[must_use]
    pub const fn new(info: Arc<ServiceInfo>, consumer: ConsumerStatus) -> Self {
        Self { info, consumer }
    }
}

#[allow(clippy::unused_async)]
async fn health(State(state): State<WorkerState>) -> impl IntoResponse {
    health_report(&state.info, vec![state.consumer.health_check()])
}

#[allow(clippy::unused_async)]
async fn index(State(state): State<WorkerState>) -> impl IntoResponse {
    Json(json!({
        "service": state.info.name(),
        "version": state.info.version(),
        "description": "Consumes checkout events from the shopping_events exchange",
        "queue": state.consumer.queue(),
        "routingKey": CHECKOUT_PATTERN,
        "subscribed": state.consumer.is_active(),
    }))
}

/// `GET /` and `GET /health`, plus `extra` routes, with the standard layers.
pub fn worker_router(state: WorkerState, extra: Router) -> Router {
    let name = state.info.name().to_string();
    let version = state.info.version().to_string();

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .with_state(state)
        .merge(extra)
        .layer(TraceLayer::new_for_http())
        .layer(service_headers_layer(&name, &version))
        .layer(correlation_id_layer())
}

/// Run a worker until SIGINT/SIGTERM.
///
/// Connects the consumer (retrying in the background), registers the worker
/// in the service registry with a heartbeat, and serves `worker_router`.
/// On shutdown the registry entry is removed and the broker connection
/// closed.
///
/// # Errors
///
/// Returns an error if the HTTP listener cannot be bound or the server
/// fails.
pub async fn run(
    config: WorkerConfig,
    handler: MessageHandler,
    extra: Router,
) -> anyhow::Result<()> {
    let name = config.kind.service_name();
    let queue = config.kind.queue();
    let info = Arc::new(ServiceInfo::new(name, WORKER_VERSION));

    tracing::info!(service = name, broker = %config.amqp.redacted_url(), "Starting worker");
    let bus = Arc::new(AmqpEventBus::new(config.amqp.clone()));
    let status = ConsumerStatus::new(queue);
    let consumer = subscribe_with_retry(
        Arc::clone(&bus) as Arc<dyn EventBus>,
        checkout_binding(queue),
        handler,
        config.consumer_retry,
        status.clone(),
    );

    let registry = Arc::new(ServiceRegistry::new(Arc::new(FileRegistryStore::new(
        config.registry_path.clone(),
    ))));
    let registration = ServiceRegistration::new(config.public_url.clone())
        .with_version(WORKER_VERSION)
        .with_endpoint("/health")
        .with_metadata("queue", json!(queue));
    let heartbeat = match RegistryHeartbeat::new(registry, name, registration)
        .with_interval(config.heartbeat_interval)
        .start()
        .await
    {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing::warn!(service = name, error = %error, "Registry registration failed");
            None
        }
    };

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(service = name, %addr, queue, "Worker listening");

    let served = axum::serve(listener, worker_router(WorkerState::new(info, status), extra))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    consumer.abort();
    if let Some(heartbeat) = heartbeat {
        if let Err(error) = heartbeat.stop().await {
            tracing::warn!(service = name, error = %error, "Registry unregistration failed");
        }
    }
    bus.close().await;
    tracing::info!(service = name, "Worker stopped");

    served.context("HTTP server failed")
}
