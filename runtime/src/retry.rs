//! Retry logic for transient failures.
//!
//! Used where the mesh must keep trying until a dependency comes back: the
//! event bus reconnecting to the broker, and workers setting up their
//! consumers on startup. Both use a fixed 5 second delay and never give up.
//!
//! # Example
//!
//! ```rust
//! use shopmesh_runtime::retry::{RetryPolicy, retry_until_ok};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let policy = RetryPolicy::fixed(Duration::from_secs(5));
//!
//! let result = retry_until_ok(&policy, || async { Ok::<_, String>(42) }).await;
//! assert_eq!(result, 42);
//! # }
//! ```

use std::time::Duration;
use tokio::time::sleep;

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    /// Retry forever with a constant delay.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Pause between two attempts.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }
}

/// Run `operation` until it succeeds, sleeping `policy.delay()` after each
/// failure. Every failure is logged at `warn`.
pub async fn retry_until_ok<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u64 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return result;
            }
            Err(err) => {
                tracing::warn!(
                    attempt,
                    delay_ms = u64::try_from(policy.delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );

                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}
