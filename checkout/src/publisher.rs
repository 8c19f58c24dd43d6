//! Publishing side of the checkout pipeline.

use shopmesh_core::event::{CHECKOUT_COMPLETED, CheckoutEvent, SHOPPING_EXCHANGE};
use shopmesh_core::event_bus::{EventBus, EventBusError, to_payload};
use std::sync::Arc;

/// Publishes completed checkouts to `shopping_events`.
///
/// A checkout is already committed when it is announced, so broker trouble
/// must never fail it: [`publish_checkout`](Self::publish_checkout) logs and
/// swallows errors. Use [`try_publish`](Self::try_publish) where the caller
/// wants to see them.
#[derive(Clone)]
pub struct CheckoutPublisher {
    bus: Arc<dyn EventBus>,
}

impl std::fmt::Debug for CheckoutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutPublisher").finish_non_exhaustive()
    }
}

impl CheckoutPublisher {
    /// Publisher over `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    /// Publish `event`, returning whether the broker accepted it.
    pub async fn publish_checkout(&self, event: &CheckoutEvent) -> bool {
        match self.try_publish(event).await {
            Ok(()) => {
                tracing::info!(
                    list_id = %event.list_id(),
                    total = %event.total(),
                    items = event.items().len(),
                    "Checkout event published"
                );
                true
            }
            Err(error) => {
                tracing::warn!(
                    list_id = %event.list_id(),
                    error = %error,
                    "Checkout event not published"
                );
                false
            }
        }
    }

    /// Publish `event` and report broker errors.
    ///
    /// # Errors
    ///
    /// Returns the [`EventBusError`] of the underlying bus.
    pub async fn try_publish(&self, event: &CheckoutEvent) -> Result<(), EventBusError> {
        let payload = to_payload(event)?;
        self.bus
            .publish(SHOPPING_EXCHANGE, CHECKOUT_COMPLETED, &payload)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shopmesh_core::event::{CheckoutItem, Customer};
    use shopmesh_testing::InMemoryEventBus;

    fn event() -> CheckoutEvent {
        CheckoutEvent::new(
            "L1",
            Customer {
                id: "u1".to_string(),
                email: "ana@example.com".to_string(),
                name: "Ana Silva".to_string(),
            },
            vec![CheckoutItem {
                item_id: "i1".to_string(),
                item_name: "Rice".to_string(),
                quantity: 2.into(),
                unit: "un".to_string(),
                estimated_price: 5.into(),
            }],
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publishes_under_the_checkout_routing_key() {
        let bus = InMemoryEventBus::new();
        let publisher = CheckoutPublisher::new(Arc::new(bus.clone()));

        assert!(publisher.publish_checkout(&event()).await);

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, SHOPPING_EXCHANGE);
        assert_eq!(published[0].routing_key, CHECKOUT_COMPLETED);
        assert_eq!(published[0].payload["listId"], "L1");
        assert_eq!(published[0].payload["total"], 10.0);
    }

    #[tokio::test]
    async fn broker_outage_is_swallowed() {
        let bus = InMemoryEventBus::new();
        bus.set_unavailable(true);
        let publisher = CheckoutPublisher::new(Arc::new(bus.clone()));

        assert!(!publisher.publish_checkout(&event()).await);
        assert!(matches!(
            publisher.try_publish(&event()).await,
            Err(EventBusError::ConnectionFailed(_))
        ));
        assert!(bus.published().is_empty());
    }
}
