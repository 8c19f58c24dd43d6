//! A topic exchange that lives inside the test process.
//!
//! Behaves like the broker as far as the mesh can tell: publishes are copied
//! into every queue whose binding matches, queues buffer messages until a
//! consumer attaches, and a failing handler drops its message without
//! requeue. Each queue delivers to its consumer one message at a time, in
//! publish order.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use shopmesh_core::event_bus::{EventBus, EventBusError, MessageHandler, QueueBinding, invoke};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};

/// A message accepted by [`InMemoryEventBus::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Target exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// JSON body
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct QueueState {
    bindings: Vec<QueueBinding>,
    backlog: VecDeque<serde_json::Value>,
    consumer: Option<mpsc::UnboundedSender<serde_json::Value>>,
    depth: usize,
    acked: usize,
    rejected: usize,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    published: Mutex<Vec<PublishedMessage>>,
    settled: Notify,
}

impl Shared {
    fn settle(&self, queue: &str, ok: bool) {
        {
            let mut queues = self.queues.lock();
            if let Some(state) = queues.get_mut(queue) {
                state.depth = state.depth.saturating_sub(1);
                if ok {
                    state.acked += 1;
                } else {
                    state.rejected += 1;
                }
            }
        }
        self.settled.notify_waiters();
    }

    fn idle(&self) -> bool {
        self.queues
            .lock()
            .values()
            .filter(|state| state.consumer.is_some())
            .all(|state| state.depth == 0)
    }
}

/// In-memory [`EventBus`] with topic-exchange routing.
///
/// ```
/// use shopmesh_core::event_bus::{message_handler, EventBus, QueueBinding};
/// use shopmesh_testing::InMemoryEventBus;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryEventBus::new();
/// let binding = QueueBinding::new("audit", "shopping_events", "list.#");
/// bus.consume(&binding, message_handler(|_| async { Ok(()) })).await?;
///
/// bus.publish("shopping_events", "list.checkout.completed", &serde_json::json!({})).await?;
/// bus.wait_idle().await;
/// assert_eq!(bus.acked("audit"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    shared: Arc<Shared>,
    unavailable: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: while set, publish and consume fail with
    /// [`EventBusError::ConnectionFailed`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Declare a queue and bind it without attaching a consumer.
    pub fn declare(&self, binding: &QueueBinding) {
        let mut queues = self.shared.queues.lock();
        let state = queues.entry(binding.queue_name.clone()).or_default();
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
    }

    /// Every message accepted so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.published.lock().clone()
    }

    /// Messages routed to `queue` and not yet acked or rejected.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared.queues.lock().get(queue).map_or(0, |s| s.depth)
    }

    /// Messages buffered in `queue` waiting for a consumer.
    #[must_use]
    pub fn backlog(&self, queue: &str) -> Vec<serde_json::Value> {
        self.shared
            .queues
            .lock()
            .get(queue)
            .map(|s| s.backlog.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages acknowledged by `queue`'s consumer.
    #[must_use]
    pub fn acked(&self, queue: &str) -> usize {
        self.shared.queues.lock().get(queue).map_or(0, |s| s.acked)
    }

    /// Messages rejected (dropped) by `queue`'s consumer.
    #[must_use]
    pub fn rejected(&self, queue: &str) -> usize {
        self.shared.queues.lock().get(queue).map_or(0, |s| s.rejected)
    }

    /// Wait until every consumed queue has settled all routed messages.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.settled.notified();
            if self.shared.idle() {
                return;
            }
            notified.await;
        }
    }

    fn ensure_available(&self) -> Result<(), EventBusError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EventBusError::ConnectionFailed(
                "in-memory broker marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str, payload: &serde_json::Value) {
        let mut queues = self.shared.queues.lock();
        for (name, state) in queues.iter_mut() {
            if !state.bindings.iter().any(|b| b.matches(exchange, routing_key)) {
                continue;
            }
            state.depth += 1;
            let undelivered = match &state.consumer {
                Some(sender) => sender.send(payload.clone()).err().map(|e| e.0),
                None => Some(payload.clone()),
            };
            if let Some(message) = undelivered {
                state.backlog.push_back(message);
            }
            tracing::trace!(queue = %name, routing_key, "Routed message");
        }
    }

    fn spawn_consumer(
        &self,
        queue: String,
        handler: MessageHandler,
        mut rx: mpsc::UnboundedReceiver<serde_json::Value>,
    ) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let ok = match invoke(&handler, message).await {
                    Ok(()) => true,
                    Err(error) => {
                        tracing::warn!(
                            queue = %queue,
                            error = %error,
                            "Handler failed, dropping message"
                        );
                        false
                    }
                };
                shared.settle(&queue, ok);
            }
        });
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> BoxFuture<'_, Result<(), EventBusError>> {
        let result = self.ensure_available().map(|()| {
            self.shared.published.lock().push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
            });
            self.route(exchange, routing_key, payload);
        });
        Box::pin(futures::future::ready(result))
    }

    fn consume(
        &self,
        binding: &QueueBinding,
        handler: MessageHandler,
    ) -> BoxFuture<'_, Result<(), EventBusError>> {
        let binding = binding.clone();

        Box::pin(async move {
            self.ensure_available()?;
            self.declare(&binding);

            let (tx, rx) = mpsc::unbounded_channel();
            {
                let mut queues = self.shared.queues.lock();
                let state = queues.entry(binding.queue_name.clone()).or_default();
                if state.consumer.is_some() {
                    return Err(EventBusError::SubscriptionFailed {
                        queue: binding.queue_name.clone(),
                        reason: "queue already has a consumer".to_string(),
                    });
                }
                for message in state.backlog.drain(..) {
                    // The receiver is alive until this function returns.
                    let _ = tx.send(message);
                }
                state.consumer = Some(tx);
            }

            self.spawn_consumer(binding.queue_name, handler, rx);
            Ok(())
        })
    }
}
