//! # Shopmesh Core
//!
//! Core traits and types shared by every shopmesh component.
//!
//! The mesh binds independently deployed HTTP services together through three
//! pieces of coordination infrastructure:
//!
//! - **Gateway**: routes external requests through per-service circuit breakers
//! - **Service registry**: tracks which service instances are reachable
//! - **Event bus**: decouples checkout from its downstream consumers
//!
//! This crate holds the vocabulary those pieces share. It performs no I/O.
//!
//! ## Modules
//!
//! - [`config`]: typed environment lookups shared by every binary
//! - [`event`]: the checkout event carried on the bus
//! - [`event_bus`]: the [`EventBus`](event_bus::EventBus) trait, queue bindings and topic matching
//! - [`registry`]: service descriptors persisted by the registry
//! - [`environment`]: injected dependencies (clock)
//!
//! ## Example
//!
//! ```
//! use shopmesh_core::event_bus::{topic_matches, QueueBinding};
//! use shopmesh_core::event::{CHECKOUT_COMPLETED, CHECKOUT_PATTERN, SHOPPING_EXCHANGE};
//!
//! let binding = QueueBinding::new("notification_queue", SHOPPING_EXCHANGE, CHECKOUT_PATTERN);
//! assert!(binding.matches(SHOPPING_EXCHANGE, CHECKOUT_COMPLETED));
//! assert!(topic_matches("list.#", "list.checkout.completed"));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Environment-variable configuration.
pub mod config;

/// Checkout events published by the list service.
pub mod event;

/// Event bus abstraction for topic-based publish/consume.
pub mod event_bus;

/// Service descriptors tracked by the registry.
pub mod registry;

/// Environment traits for dependency injection.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The registry uses it to stamp descriptors and to decide staleness during
    /// sweeps, so tests can move time forward without sleeping.
    ///
    /// # Examples
    ///
    /// ```
    /// use shopmesh_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

// Re-export commonly used types
pub use config::{ConfigError, Env};
pub use environment::{Clock, SystemClock};
pub use event::{AmountOverflow, CheckoutEvent, CheckoutItem};
pub use event_bus::{EventBus, EventBusError, MessageHandler, QueueBinding};
pub use registry::{RegistryDocument, ServiceDescriptor, ServiceRegistration};
