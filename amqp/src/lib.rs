//! RabbitMQ event bus for the shopmesh services.
//!
//! Implements [`EventBus`] over one AMQP connection and one channel, with a
//! durable topic exchange (`shopping_events` by default).
//!
//! # Delivery Semantics
//!
//! - Messages are JSON, published persistent (delivery mode 2) with publisher
//!   confirms; a broker nack surfaces as [`EventBusError::PublishRejected`].
//! - Each consumer declares a durable queue and binds it to a routing-key
//!   pattern. Distinct queues on the same pattern each get a full copy.
//! - A delivery is acked when its handler succeeds and nacked **without
//!   requeue** when it fails, panics or the body is not JSON. No dead-letter
//!   queue is configured, so a failed message is gone.
//!
//! # Reconnection
//!
//! When the broker drops the connection, or closes the channel under a live
//! connection, the bus waits `reconnect_delay` (5 s by default), then retries
//! forever on the same delay. A replaced connection is closed first. Whenever
//! a new session replaces a lost one, consumers registered through
//! [`EventBus::consume`] are re-established on it. `publish` and `consume` on
//! a disconnected bus connect first; only one connect runs at a time.
//!
//! # Example
//!
//! ```no_run
//! use shopmesh_amqp::{AmqpConfig, AmqpEventBus};
//! use shopmesh_core::event_bus::{message_handler, EventBus, QueueBinding};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = AmqpEventBus::new(AmqpConfig::from_env()?);
//!
//! let binding = QueueBinding::new("analytics_queue", "shopping_events", "list.checkout.#");
//! bus.consume(&binding, message_handler(|payload| async move {
//!     tracing::info!(%payload, "checkout received");
//!     Ok(())
//! }))
//! .await?;
//!
//! bus.publish("shopping_events", "list.checkout.completed", &serde_json::json!({"listId": "L1"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;

pub use config::AmqpConfig;

use futures::StreamExt;
use futures::future::BoxFuture;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use parking_lot::{Mutex, RwLock};
use shopmesh_core::event_bus::{EventBus, EventBusError, MessageHandler, QueueBinding, invoke};
use shopmesh_runtime::metrics::EventBusMetrics;
use shopmesh_runtime::retry::{RetryPolicy, retry_until_ok};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

/// AMQP-backed [`EventBus`].
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct AmqpEventBus {
    inner: Arc<Inner>,
}

struct Session {
    generation: u64,
    connection: Connection,
    channel: Channel,
}

#[derive(Clone)]
struct Subscription {
    binding: QueueBinding,
    handler: MessageHandler,
}

struct Inner {
    config: AmqpConfig,
    session: RwLock<Option<Session>>,
    connecting: tokio::sync::Mutex<()>,
    declared: Mutex<HashSet<String>>,
    subscriptions: Mutex<Vec<Subscription>>,
    reconnecting: AtomicBool,
    needs_resume: AtomicBool,
    generation: AtomicU64,
}

impl std::fmt::Debug for AmqpEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpEventBus")
            .field("broker", &self.inner.config.redacted_url())
            .field("exchange", &self.inner.config.exchange)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl AmqpEventBus {
    /// Create a bus. Nothing connects until [`connect`](Self::connect) or the
    /// first publish/consume.
    #[must_use]
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                session: RwLock::new(None),
                connecting: tokio::sync::Mutex::new(()),
                declared: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(Vec::new()),
                reconnecting: AtomicBool::new(false),
                needs_resume: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// The bus configuration.
    #[must_use]
    pub fn config(&self) -> &AmqpConfig {
        &self.inner.config
    }

    /// Open the connection and channel, declaring the default exchange.
    ///
    /// Does nothing if already connected.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the broker cannot be
    /// reached or refuses the channel.
    pub async fn connect(&self) -> Result<(), EventBusError> {
        self.inner.connect().await.map(|_| ())
    }

    /// Whether a live connection is held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.channel().is_some()
    }

    /// Close the connection for graceful shutdown. Registered consumers are
    /// not resumed afterwards.
    pub async fn close(&self) {
        self.inner.subscriptions.lock().clear();
        let session = self.inner.session.write().take();
        if let Some(session) = session {
            if let Err(error) = session.connection.close(200, "shutdown").await {
                tracing::warn!(error = %error, "Failed to close AMQP connection cleanly");
            }
            tracing::info!("AMQP connection closed");
        }
    }
}

impl Inner {
    fn channel(&self) -> Option<Channel> {
        self.session
            .read()
            .as_ref()
            .filter(|s| s.connection.status().connected() && s.channel.status().connected())
            .map(|s| s.channel.clone())
    }

    async fn connect(self: &Arc<Self>) -> Result<Channel, EventBusError> {
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        let _guard = self.connecting.lock().await;
        if let Some(channel) = self.channel() {
            return Ok(channel);
        }

        let stale = self.session.write().take();
        if let Some(stale) = stale {
            self.needs_resume.store(true, Ordering::SeqCst);
            if stale.connection.status().connected() {
                tracing::warn!("AMQP channel closed, replacing connection");
                if let Err(error) = stale.connection.close(200, "replacing channel").await {
                    tracing::warn!(error = %error, "Failed to close stale AMQP connection");
                }
            }
        }

        let broker = self.config.redacted_url();
        tracing::debug!(broker = %broker, "Connecting to AMQP broker");

        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| EventBusError::ConnectionFailed(format!("{broker}: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| EventBusError::ConnectionFailed(format!("failed to open channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("failed to enable confirms: {e}"))
            })?;
        declare_topic_exchange(&channel, &self.config.exchange).await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let runtime = Handle::current();
        let weak: Weak<Self> = Arc::downgrade(self);
        connection.on_error(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.connection_lost(generation, &error, &runtime);
            }
        });

        {
            let mut declared = self.declared.lock();
            declared.clear();
            declared.insert(self.config.exchange.clone());
        }
        *self.session.write() = Some(Session {
            generation,
            connection,
            channel: channel.clone(),
        });

        tracing::info!(
            broker = %broker,
            exchange = %self.config.exchange,
            "Connected to AMQP broker"
        );
        if self.needs_resume.swap(false, Ordering::SeqCst) {
            self.schedule_resume();
        }
        Ok(channel)
    }

    // Runs on the client's I/O thread, not on a tokio worker.
    fn connection_lost(self: &Arc<Self>, generation: u64, error: &lapin::Error, runtime: &Handle) {
        {
            let mut session = self.session.write();
            if session.as_ref().is_none_or(|s| s.generation != generation) {
                return;
            }
            session.take();
        }
        tracing::error!(error = %error, "AMQP connection lost");
        self.needs_resume.store(true, Ordering::SeqCst);
        self.schedule_reconnect(runtime);
    }

    fn consumer_stopped(self: &Arc<Self>, queue: &str) {
        let subscribed = self
            .subscriptions
            .lock()
            .iter()
            .any(|s| s.binding.queue_name == queue);
        if subscribed {
            tracing::warn!(queue = %queue, "Consumer cancelled while subscribed");
            self.schedule_reconnect(&Handle::current());
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, runtime: &Handle) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        runtime.spawn(async move { inner.reconnect().await });
    }

    async fn reconnect(self: Arc<Self>) {
        let delay = self.config.reconnect_delay;
        tracing::info!(delay_secs = delay.as_secs(), "Scheduling AMQP reconnect");
        tokio::time::sleep(delay).await;

        retry_until_ok(&RetryPolicy::fixed(delay), || async {
            EventBusMetrics::record_reconnect();
            self.connect().await
        })
        .await;
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    fn schedule_resume(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.resume_consumers().await });
    }

    async fn resume_consumers(self: &Arc<Self>) {
        let subscriptions = self.subscriptions.lock().clone();
        for subscription in subscriptions {
            let queue = subscription.binding.queue_name.clone();
            match self
                .start_consumer(&subscription.binding, subscription.handler)
                .await
            {
                Ok(()) => tracing::info!(queue = %queue, "Consumer resumed"),
                Err(error) => {
                    tracing::error!(queue = %queue, error = %error, "Failed to resume consumer");
                }
            }
        }
    }

    async fn ensure_exchange(
        &self,
        channel: &Channel,
        exchange: &str,
    ) -> Result<(), EventBusError> {
        if self.declared.lock().contains(exchange) {
            return Ok(());
        }
        declare_topic_exchange(channel, exchange).await?;
        self.declared.lock().insert(exchange.to_string());
        Ok(())
    }

    async fn publish(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), EventBusError> {
        let channel = self.connect().await?;
        self.ensure_exchange(&channel, exchange).await?;

        let failed = |reason: String| EventBusError::PublishFailed {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason,
        };

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| failed(e.to_string()))?
            .await
            .map_err(|e| failed(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(EventBusError::PublishRejected {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn start_consumer(
        self: &Arc<Self>,
        binding: &QueueBinding,
        handler: MessageHandler,
    ) -> Result<(), EventBusError> {
        let channel = self.connect().await?;
        self.ensure_exchange(&channel, &binding.exchange_name).await?;

        let failed = |reason: String| EventBusError::SubscriptionFailed {
            queue: binding.queue_name.clone(),
            reason,
        };

        channel
            .queue_declare(
                &binding.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| failed(format!("failed to declare queue: {e}")))?;

        channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key_pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| failed(format!("failed to bind queue: {e}")))?;

        let consumer_tag = format!("{}-{}", binding.queue_name, uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &binding.queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| failed(format!("failed to start consumer: {e}")))?;

        tracing::info!(
            queue = %binding.queue_name,
            exchange = %binding.exchange_name,
            pattern = %binding.routing_key_pattern,
            "Consuming"
        );

        tokio::spawn(process_deliveries(
            Arc::downgrade(self),
            binding.queue_name.clone(),
            consumer,
            handler,
        ));
        Ok(())
    }
}

async fn declare_topic_exchange(channel: &Channel, exchange: &str) -> Result<(), EventBusError> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            EventBusError::TransportError(format!("failed to declare exchange {exchange}: {e}"))
        })
}

async fn process_deliveries(
    bus: Weak<Inner>,
    queue: String,
    mut consumer: Consumer,
    handler: MessageHandler,
) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(error) => {
                tracing::warn!(queue = %queue, error = %error, "Consumer stream failed");
                break;
            }
        };

        let outcome = match serde_json::from_slice::<serde_json::Value>(&delivery.data) {
            Ok(payload) => invoke(&handler, payload).await,
            Err(error) => Err(anyhow::Error::new(error).context("message body is not JSON")),
        };

        match outcome {
            Ok(()) => match delivery.ack(BasicAckOptions::default()).await {
                Ok(()) => EventBusMetrics::record_ack(&queue),
                Err(error) => {
                    tracing::warn!(queue = %queue, error = %error, "Failed to ack message");
                }
            },
            Err(error) => {
                tracing::warn!(
                    queue = %queue,
                    routing_key = %delivery.routing_key.as_str(),
                    error = %error,
                    "Handler failed, dropping message"
                );
                EventBusMetrics::record_reject(&queue);
                let options = BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                };
                if let Err(error) = delivery.nack(options).await {
                    tracing::warn!(queue = %queue, error = %error, "Failed to nack message");
                }
            }
        }
    }

    tracing::info!(queue = %queue, "Consumer stopped");
    if let Some(inner) = bus.upgrade() {
        inner.consumer_stopped(&queue);
    }
}

impl EventBus for AmqpEventBus {
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> BoxFuture<'_, Result<(), EventBusError>> {
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        let body = serde_json::to_vec(payload);

        Box::pin(async move {
            let body = body.map_err(|e| EventBusError::SerializationFailed(e.to_string()))?;
            let result = self.inner.publish(&exchange, &routing_key, body).await;

            match &result {
                Ok(()) => {
                    EventBusMetrics::record_publish(&routing_key);
                    tracing::debug!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        "Published message"
                    );
                }
                Err(error) => {
                    EventBusMetrics::record_publish_error(&routing_key);
                    tracing::warn!(
                        exchange = %exchange,
                        routing_key = %routing_key,
                        error = %error,
                        "Publish failed"
                    );
                }
            }
            result
        })
    }

    fn consume(
        &self,
        binding: &QueueBinding,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<(), EventBusError>> {
        let binding = binding.clone();

        Box::pin(async move {
            self.inner
                .start_consumer(&binding, Arc::clone(&handler))
                .await?;
            self.inner
                .subscriptions
                .lock()
                .push(Subscription { binding, handler });
            Ok(())
        })
    }
}
