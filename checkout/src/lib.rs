//! # Shopmesh Checkout
//!
//! The asynchronous half of a checkout. The list service announces each
//! completed purchase once on the `shopping_events` exchange; two workers
//! bind their own durable queues to `list.checkout.#` and each receive a full
//! copy:
//!
//! - **notification-service** renders a receipt and hands it to a
//!   [`Notifier`](notification::Notifier)
//! - **analytics-service** keeps running totals, served on `GET /stats`
//!
//! Both are idempotent on the event's list ID. A handler error drops the
//! message without requeue.
//!
//! ## Example
//!
//! ```
//! use shopmesh_checkout::analytics::AnalyticsHandler;
//! use shopmesh_checkout::worker::{checkout_binding, checkout_handler};
//! use shopmesh_core::event_bus::EventBus;
//! use shopmesh_testing::InMemoryEventBus;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let bus = InMemoryEventBus::new();
//! let analytics = Arc::new(AnalyticsHandler::new());
//! bus.consume(&checkout_binding("analytics_queue"), checkout_handler(Arc::clone(&analytics)))
//!     .await?;
//! assert_eq!(analytics.stats().total_checkouts, 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analytics;
pub mod config;
pub mod dedup;
pub mod notification;
pub mod publisher;
pub mod worker;

pub use analytics::{AnalyticsHandler, CheckoutStats};
pub use config::{WorkerConfig, WorkerKind};
pub use notification::{LogNotifier, NotificationHandler, Notifier, Receipt};
pub use publisher::CheckoutPublisher;
pub use worker::{CheckoutConsumer, Delivery, checkout_binding, checkout_handler};
