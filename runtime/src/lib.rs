//! # Shopmesh Runtime
//!
//! Stateful coordination pieces shared by the gateway and the services.
//!
//! ## Core Components
//!
//! - **Circuit breakers**: per-service failure tracking for the gateway
//! - **Service registry**: register/discover/sweep over a shared document
//! - **Heartbeat**: keeps a service's own registry entry alive
//! - **Retry**: reconnect and startup retry policy
//! - **Metrics**: Prometheus recorders and exporter
//!
//! ## Example
//!
//! ```rust
//! use shopmesh_runtime::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerTable, State};
//!
//! let breakers = CircuitBreakerTable::new(
//!     ["user-service", "list-service", "item-service"],
//!     CircuitBreakerConfig::default(),
//! );
//!
//! let items = breakers.get("item-service");
//! assert!(items.is_some_and(|b| b.state() == State::Closed));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Health status vocabulary
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Service registry and its stores
pub mod registry;

/// Retry policy for reconnects and startup
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerTable};
pub use health::{HealthCheck, HealthStatus};
pub use registry::{
    DiscoveryError, FileRegistryStore, InMemoryRegistryStore, RegistryConfig, RegistryError,
    RegistryHeartbeat, RegistryStore, ServiceRegistry,
};
pub use retry::{RetryPolicy, retry_until_ok};
