//! Event bus abstraction for topic-based publish/consume.
//!
//! This module provides the [`EventBus`] trait used by producers (the list
//! service publishing checkouts) and consumers (notification, analytics).
//! The model is a topic exchange: messages are published to an exchange with
//! a routing key and copied into every durable queue whose binding pattern
//! matches that key.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish(shopping_events, list.checkout.completed)
//! │ list service │──────────────────────┐
//! └──────────────┘                      ▼
//!                               ┌───────────────┐
//!                               │ topic exchange│
//!                               └───────┬───────┘
//!                     list.checkout.#   │   list.checkout.#
//!                    ┌──────────────────┴──────────────────┐
//!                    ▼                                     ▼
//!          ┌────────────────────┐               ┌─────────────────┐
//!          │ notification_queue │               │ analytics_queue │
//!          └────────────────────┘               └─────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - **Fan-out**: distinct queues on the same pattern each get a full copy
//! - **Persistent**: messages survive a broker restart
//! - **At-least-once**: consumers may see a message twice and must be idempotent
//! - **Drop on failure**: a handler error rejects the message without requeue
//!
//! # Implementations
//!
//! - `AmqpEventBus` (`shopmesh-amqp`) - RabbitMQ via lapin
//! - `InMemoryEventBus` (`shopmesh-testing`) - in-process exchange for tests

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message
    #[error("Publish failed for '{exchange}' / '{routing_key}': {reason}")]
    PublishFailed {
        /// Target exchange
        exchange: String,
        /// Routing key of the message
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker negatively acknowledged a publish
    #[error("Broker rejected message for '{exchange}' / '{routing_key}'")]
    PublishRejected {
        /// Target exchange
        exchange: String,
        /// Routing key of the message
        routing_key: String,
    },

    /// Failed to declare, bind or consume a queue
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscriptionFailed {
        /// Queue that could not be set up
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to serialize a payload
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A durable queue bound to an exchange with a routing-key pattern.
///
/// Declared once at consumer startup. Several queues may bind the same
/// pattern; each then receives its own copy of every matching message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueBinding {
    /// Durable queue name (e.g. `notification_queue`)
    pub queue_name: String,
    /// Topic exchange the queue is bound to
    pub exchange_name: String,
    /// Binding pattern (`*` = one word, `#` = zero or more words)
    pub routing_key_pattern: String,
}

impl QueueBinding {
    /// Create a binding.
    #[must_use]
    pub fn new(
        queue_name: impl Into<String>,
        exchange_name: impl Into<String>,
        routing_key_pattern: impl Into<String>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            exchange_name: exchange_name.into(),
            routing_key_pattern: routing_key_pattern.into(),
        }
    }

    /// Whether a message published to `exchange` with `routing_key` is routed
    /// into this queue.
    #[must_use]
    pub fn matches(&self, exchange: &str, routing_key: &str) -> bool {
        self.exchange_name == exchange && topic_matches(&self.routing_key_pattern, routing_key)
    }
}

/// AMQP topic-exchange matching.
///
/// Keys and patterns are `.`-separated words. In a pattern `*` matches exactly
/// one word and `#` matches zero or more words.
///
/// ```
/// use shopmesh_core::event_bus::topic_matches;
///
/// assert!(topic_matches("list.checkout.#", "list.checkout.completed"));
/// assert!(topic_matches("list.checkout.#", "list.checkout"));
/// assert!(topic_matches("list.*.completed", "list.checkout.completed"));
/// assert!(!topic_matches("list.*", "list.checkout.completed"));
/// ```
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    let Some((head, rest)) = pattern.split_first() else {
        return key.is_empty();
    };

    match *head {
        "#" => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        "*" => key
            .split_first()
            .is_some_and(|(_, key_rest)| words_match(rest, key_rest)),
        word => key
            .split_first()
            .is_some_and(|(first, key_rest)| *first == word && words_match(rest, key_rest)),
    }
}

/// Result of a message handler.
///
/// `Ok` acknowledges the message; `Err` rejects it without requeue.
pub type HandlerResult = anyhow::Result<()>;

/// Per-message callback registered with [`EventBus::consume`].
///
/// Receives the deserialized JSON body of each delivery.
pub type MessageHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
///
/// ```
/// use shopmesh_core::event_bus::message_handler;
///
/// let handler = message_handler(|body| async move {
///     anyhow::ensure!(body.get("listId").is_some(), "missing listId");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |body| Box::pin(handler(body)))
}

/// Run `handler` on one delivery body.
///
/// A handler that panics yields an error, so the consumer loop rejects the
/// message and keeps going.
pub async fn invoke(handler: &MessageHandler, body: serde_json::Value) -> HandlerResult {
    match AssertUnwindSafe(async move { handler(body).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("message handler panicked")),
    }
}

/// Serialize a value into a bus payload.
///
/// # Errors
///
/// Returns [`EventBusError::SerializationFailed`] if the value cannot be
/// represented as JSON.
pub fn to_payload<T: Serialize>(value: &T) -> Result<serde_json::Value, EventBusError> {
    serde_json::to_value(value).map_err(|e| EventBusError::SerializationFailed(e.to_string()))
}

/// Trait for event bus implementations.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one bus instance is shared by every
/// request handler and consumer loop in a process.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures instead of `async fn` so the bus can be held
/// as `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Publish a JSON message to `exchange` with `routing_key`.
    ///
    /// Messages are marked persistent. A disconnected bus connects first.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] or
    /// [`EventBusError::PublishRejected`] when the broker does not accept the
    /// message, and [`EventBusError::ConnectionFailed`] when no connection can
    /// be established.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> BoxFuture<'_, Result<(), EventBusError>>;

    /// Declare the binding's durable queue, bind it and start delivering
    /// messages to `handler`.
    ///
    /// Returns once the consumer is registered; deliveries are processed in
    /// the background. Successful handler calls ack, failures nack without
    /// requeue.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if the queue cannot be
    /// declared, bound or consumed.
    fn consume(
        &self,
        binding: &QueueBinding,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<(), EventBusError>>;
}
