//! # Shopmesh Testing
//!
//! Testing utilities for the shopmesh crates.
//!
//! This crate provides:
//! - Clocks for deterministic registry timing
//! - [`InMemoryEventBus`]: a topic exchange that runs inside the test process
//! - [`MockService`]: a real loopback HTTP server standing in for a downstream
//!   service, with a call counter
//!
//! ## Example
//!
//! ```no_run
//! use shopmesh_testing::MockService;
//! use axum::http::{Method, StatusCode};
//! use serde_json::json;
//!
//! # async fn example() -> std::io::Result<()> {
//! let items = MockService::builder()
//!     .route(Method::GET, "/42", StatusCode::OK, json!({"id": "42"}))
//!     .start()
//!     .await?;
//!
//! // point the code under test at items.base_url() ...
//! assert_eq!(items.calls(), 0);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use shopmesh_core::environment::Clock;

/// In-process topic exchange implementing `EventBus`.
pub mod event_bus;

/// Loopback HTTP servers for downstream mocks.
pub mod service;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use parking_lot::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use shopmesh_testing::mocks::FixedClock;
    /// use shopmesh_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Registry staleness tests advance it past the sweep window instead of
    /// sleeping.
    ///
    /// ```
    /// use shopmesh_testing::mocks::ManualClock;
    /// use shopmesh_core::environment::Clock;
    ///
    /// let clock = ManualClock::default();
    /// let start = clock.now();
    /// clock.advance(chrono::Duration::minutes(3));
    /// assert_eq!(clock.now() - start, chrono::Duration::minutes(3));
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock();
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock() = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

// Re-export commonly used items
pub use event_bus::{InMemoryEventBus, PublishedMessage};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use service::{MockService, RecordedRequest};
