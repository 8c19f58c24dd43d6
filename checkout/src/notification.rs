//! Checkout receipts.
//!
//! Every completed checkout produces one receipt for the customer. Delivery
//! goes through a [`Notifier`]; the default [`LogNotifier`] writes the
//! receipt to the log instead of sending mail.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use shopmesh_core::event::{AmountOverflow, CheckoutEvent};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::dedup::SeenKeys;
use crate::worker::{CheckoutConsumer, Delivery};

/// One line of a receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLine {
    /// Item display name
    pub name: String,
    /// Purchased quantity
    pub quantity: Decimal,
    /// Unit of measure
    pub unit: String,
    /// Estimated unit price
    pub unit_price: Decimal,
    /// `quantity * unit_price`
    pub subtotal: Decimal,
}

/// Receipt for one checkout, addressed to the customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Shopping list that was checked out
    pub list_id: String,
    /// Recipient e-mail
    pub email: String,
    /// Recipient display name
    pub name: String,
    /// Purchased lines, in checkout order
    pub lines: Vec<ReceiptLine>,
    /// Checkout total
    pub total: Decimal,
    /// When the checkout completed
    pub completed_at: DateTime<Utc>,
}

impl Receipt {
    /// Receipt for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`AmountOverflow`] if a line subtotal cannot be represented.
    pub fn from_event(event: &CheckoutEvent) -> Result<Self, AmountOverflow> {
        let lines = event
            .items()
            .iter()
            .map(|item| {
                Ok(ReceiptLine {
                    name: item.item_name.clone(),
                    quantity: item.quantity,
                    unit: item.unit.clone(),
                    unit_price: item.estimated_price,
                    subtotal: item.subtotal()?.round_dp(2),
                })
            })
            .collect::<Result<_, AmountOverflow>>()?;

        Ok(Self {
            list_id: event.list_id().to_string(),
            email: event.user_email().to_string(),
            name: event.user_name().to_string(),
            lines,
            total: event.total(),
            completed_at: event.timestamp(),
        })
    }

    /// Mail subject line.
    #[must_use]
    pub fn subject(&self) -> String {
        format!("Your purchase receipt for list {}", self.list_id)
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hello {},", self.name)?;
        writeln!(
            f,
            "your purchase of {} was completed.",
            self.completed_at.format("%Y-%m-%d %H:%M UTC")
        )?;
        writeln!(f)?;
        for line in &self.lines {
            writeln!(
                f,
                "  {} {} {} x {:.2} = {:.2}",
                line.quantity.normalize(),
                line.unit,
                line.name,
                line.unit_price,
                line.subtotal
            )?;
        }
        writeln!(f)?;
        write!(f, "Total: {:.2}", self.total)
    }
}

/// Delivers receipts to customers.
pub trait Notifier: Send + Sync {
    /// Deliver `receipt`.
    ///
    /// # Errors
    ///
    /// Returns an error if the receipt could not be handed to the channel.
    fn send<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Notifier that logs receipts, optionally pausing to stand in for a mail
/// provider round trip.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    delay: Duration,
}

impl LogNotifier {
    /// Notifier that pauses `delay` per receipt.
    #[must_use]
    pub const fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Notifier for LogNotifier {
    fn send<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            tracing::info!(
                list_id = %receipt.list_id,
                to = %receipt.email,
                subject = %receipt.subject(),
                body = %receipt,
                "Receipt sent"
            );
            Ok(())
        })
    }
}

/// Consumer turning checkout events into receipts.
///
/// A list ID is remembered before the receipt goes out and forgotten again
/// if sending fails, so a redelivery of a sent receipt is skipped while a
/// failed one can be retried.
pub struct NotificationHandler {
    notifier: Arc<dyn Notifier>,
    seen: SeenKeys,
    sent: AtomicU64,
}

impl fmt::Debug for NotificationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationHandler")
            .field("sent", &self.sent())
            .finish_non_exhaustive()
    }
}

impl NotificationHandler {
    /// Handler delivering through `notifier`.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            seen: SeenKeys::default(),
            sent: AtomicU64::new(0),
        }
    }

    /// Receipts sent so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl CheckoutConsumer for NotificationHandler {
    fn handle<'a>(&'a self, event: &'a CheckoutEvent) -> BoxFuture<'a, anyhow::Result<Delivery>> {
        Box::pin(async move {
            let receipt = Receipt::from_event(event)?;
            if !self.seen.insert(event.list_id()) {
                return Ok(Delivery::Duplicate);
            }

            if let Err(error) = self.notifier.send(&receipt).await {
                self.seen.remove(event.list_id());
                return Err(error.context(format!("receipt for list {} not sent", event.list_id())));
            }

            self.sent.fetch_add(1, Ordering::Relaxed);
            Ok(Delivery::Processed)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use shopmesh_core::event::{CheckoutItem, Customer};
    use std::str::FromStr;

    #[derive(Default)]
    struct RecordingNotifier {
        receipts: Mutex<Vec<Receipt>>,
        fail_next: std::sync::atomic::AtomicBool,
    }

    impl Notifier for RecordingNotifier {
        fn send<'a>(&'a self, receipt: &'a Receipt) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                if self.fail_next.swap(false, Ordering::SeqCst) {
                    anyhow::bail!("smtp unavailable");
                }
                self.receipts.lock().push(receipt.clone());
                Ok(())
            })
        }
    }

    fn event(list_id: &str) -> CheckoutEvent {
        CheckoutEvent::new(
            list_id,
            Customer {
                id: "u1".to_string(),
                email: "ana@example.com".to_string(),
                name: "Ana Silva".to_string(),
            },
            vec![
                CheckoutItem {
                    item_id: "i1".to_string(),
                    item_name: "Rice".to_string(),
                    quantity: Decimal::from(2),
                    unit: "un".to_string(),
                    estimated_price: Decimal::from_str("4.5").unwrap(),
                },
                CheckoutItem {
                    item_id: "i2".to_string(),
                    item_name: "Cheese".to_string(),
                    quantity: Decimal::from_str("0.25").unwrap(),
                    unit: "kg".to_string(),
                    estimated_price: Decimal::from(40),
                },
            ],
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn receipt_lists_every_item_and_the_total() {
        let text = Receipt::from_event(&event("L1")).unwrap().to_string();

        assert!(text.starts_with("Hello Ana Silva,"));
        assert!(text.contains("2025-03-01 12:30 UTC"));
        assert!(text.contains("2 un Rice x 4.50 = 9.00"));
        assert!(text.contains("0.25 kg Cheese x 40.00 = 10.00"));
        assert!(text.ends_with("Total: 19.00"));
    }

    #[tokio::test]
    async fn redelivered_checkout_sends_one_receipt() {
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = NotificationHandler::new(Arc::clone(&notifier) as Arc<dyn Notifier>);

        assert_eq!(handler.handle(&event("L1")).await.unwrap(), Delivery::Processed);
        assert_eq!(handler.handle(&event("L1")).await.unwrap(), Delivery::Duplicate);

        assert_eq!(notifier.receipts.lock().len(), 1);
        assert_eq!(handler.sent(), 1);
    }

    #[tokio::test]
    async fn failed_send_can_be_retried() {
        let notifier = Arc::new(RecordingNotifier::default());
        notifier.fail_next.store(true, Ordering::SeqCst);
        let handler = NotificationHandler::new(Arc::clone(&notifier) as Arc<dyn Notifier>);

        let error = handler.handle(&event("L1")).await.unwrap_err();
        assert!(format!("{error:#}").contains("smtp unavailable"));

        assert_eq!(handler.handle(&event("L1")).await.unwrap(), Delivery::Processed);
        assert_eq!(notifier.receipts.lock()[0].email, "ana@example.com");
    }

    #[tokio::test]
    async fn unrepresentable_subtotal_fails_without_remembering_the_list() {
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = NotificationHandler::new(Arc::clone(&notifier) as Arc<dyn Notifier>);
        let oversized: CheckoutEvent = serde_json::from_value(serde_json::json!({
            "listId": "L1",
            "userId": "u1",
            "userEmail": "ana@example.com",
            "userName": "Ana Silva",
            "items": [{
                "itemId": "i1",
                "itemName": "Gold",
                "quantity": 1e20,
                "unit": "kg",
                "estimatedPrice": 1e20
            }],
            "total": 10.0,
            "timestamp": "2025-03-01T12:00:00Z"
        }))
        .unwrap();

        let error = handler.handle(&oversized).await.unwrap_err();
        assert!(error.to_string().contains("out of range"));
        assert!(notifier.receipts.lock().is_empty());

        assert_eq!(handler.handle(&event("L1")).await.unwrap(), Delivery::Processed);
    }
}
