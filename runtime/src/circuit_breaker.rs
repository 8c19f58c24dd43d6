//! Circuit breaker pattern for preventing cascading failures.
//!
//! One breaker guards each downstream service. It "opens" (stops allowing
//! requests) after a run of failures, so a dead service costs callers an
//! immediate 503 instead of a timeout, and recovery is tested with a single
//! probe instead of a thundering herd.
//!
//! # States
//!
//! - **Closed**: Normal operation. Requests pass through. Failures are counted.
//!   Successes do not clear the count, so occasional errors add up.
//! - **Open**: Threshold reached. Requests are rejected without a call until
//!   the cooldown since the last failure has elapsed.
//! - **HalfOpen**: Cooldown elapsed. Exactly one probe request is admitted.
//!   Success closes the breaker; failure reopens it and restarts the cooldown.
//!
//! # Example
//!
//! ```rust
//! use shopmesh_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(3)
//!     .cooldown(Duration::from_secs(30))
//!     .build();
//!
//! let breaker = CircuitBreaker::new("item-service", config);
//!
//! match breaker.try_acquire() {
//!     // The gateway classifies the outcome: a 404 is a success, a 502 a failure.
//!     Ok(permit) => permit.record_success(),
//!     Err(open) => println!("rejected, retry after {:?}", open.retry_after),
//! }
//! ```
//!
//! Only the half-open probe permit can close the breaker. A permit granted
//! while Closed that settles after the breaker opened leaves the state alone,
//! so a slow straggler cannot cut the cooldown short.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::metrics::BreakerMetrics;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before an Open breaker admits a probe
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            cooldown: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<u32>,
    cooldown: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens once this many failures have been recorded.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the cooldown window.
    #[must_use]
    pub const fn cooldown(mut self, duration: Duration) -> Self {
        self.cooldown = Some(duration);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            cooldown: self.cooldown.unwrap_or(defaults.cooldown),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, one probe tests whether the service recovered
    HalfOpen,
}

impl State {
    /// Wire name (`CLOSED`, `OPEN`, `HALF_OPEN`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission was refused because the breaker is open.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("circuit open, retry after {retry_after:?}")]
pub struct CircuitOpen {
    /// Remaining cooldown (zero while a half-open probe is in flight)
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl BreakerState {
    const fn closed() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

/// Circuit breaker for one downstream service.
///
/// State lives behind a single mutex that is never held across an await, so
/// concurrent outcomes for the same service are applied one at a time and
/// none are lost.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker guarding `service`.
    #[must_use]
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    /// Name of the guarded service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    ///
    /// An Open breaker whose cooldown has elapsed still reports `Open` until
    /// the next admission attempt moves it to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> State {
        self.state.lock().state
    }

    /// Ask to send one request through the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpen`] when the breaker is Open and still cooling
    /// down, or HalfOpen with its probe already in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>, CircuitOpen> {
        let mut state = self.state.lock();

        match state.state {
            State::Closed => Ok(Permit::new(self, false)),
            State::Open => {
                let elapsed = state
                    .last_failure
                    .map_or(self.config.cooldown, |at| at.elapsed());

                if elapsed >= self.config.cooldown {
                    self.transition(&mut state, State::HalfOpen);
                    state.probe_in_flight = true;
                    Ok(Permit::new(self, true))
                } else {
                    drop(state);
                    Err(self.reject(self.config.cooldown.saturating_sub(elapsed)))
                }
            }
            State::HalfOpen => {
                if state.probe_in_flight {
                    drop(state);
                    Err(self.reject(Duration::ZERO))
                } else {
                    state.probe_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    fn reject(&self, retry_after: Duration) -> CircuitOpen {
        BreakerMetrics::record_rejection(&self.service);
        tracing::warn!(
            service = %self.service,
            retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
            "Circuit breaker is OPEN, rejecting request"
        );
        CircuitOpen { retry_after }
    }

    /// Record a success observed outside of admission (e.g. a health probe).
    ///
    /// A success while HalfOpen or Open closes the breaker.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.state != State::Closed {
            self.close(&mut state);
        }
    }

    fn settle_success(&self, probe: bool) {
        let mut state = self.state.lock();
        // Closed: successes leave the failure count alone.
        // Open or HalfOpen: only the probe decides.
        if probe && state.state == State::HalfOpen {
            self.close(&mut state);
        }
    }

    fn close(&self, state: &mut BreakerState) {
        self.transition(state, State::Closed);
        state.consecutive_failures = 0;
        state.probe_in_flight = false;
    }

    /// Record a failure observed outside of admission (e.g. a health probe).
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
        state.last_failure_at = Some(Utc::now());

        match state.state {
            State::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        service = %self.service,
                        failures = state.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Failure threshold reached"
                    );
                    self.transition(&mut state, State::Open);
                }
            }
            State::HalfOpen => {
                tracing::warn!(service = %self.service, "Recovery probe failed");
                self.transition(&mut state, State::Open);
                state.probe_in_flight = false;
            }
            // Already open: the stamp above restarts the cooldown.
            State::Open => {}
        }
    }

    fn release_probe(&self) {
        let mut state = self.state.lock();
        if state.state == State::HalfOpen {
            state.probe_in_flight = false;
        }
    }

    fn transition(&self, state: &mut BreakerState, to: State) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        tracing::info!(
            service = %self.service,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit breaker transition"
        );
        BreakerMetrics::record_transition(&self.service, from.as_str(), to.as_str());
        BreakerMetrics::record_state(&self.service, to.gauge_value());
    }

    /// Point-in-time view of the breaker, as served on the health endpoint.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state.lock();
        CircuitBreakerSnapshot {
            service_name: self.service.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            last_failure_at: state.last_failure_at,
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        tracing::info!(service = %self.service, "Circuit breaker manually reset to CLOSED");
        self.transition(&mut state, State::Closed);
        *state = BreakerState::closed();
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Settle it with [`Permit::record_success`] or [`Permit::record_failure`].
/// Dropping an unsettled probe permit frees the half-open slot without
/// changing state, so a cancelled probe cannot wedge the breaker.
#[must_use = "settle the permit with record_success or record_failure"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    const fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this request is the half-open recovery probe.
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe
    }

    /// The call succeeded.
    ///
    /// Closes the breaker only if this is the half-open probe.
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle_success(self.probe);
    }

    /// The call failed (transport error, timeout or 5xx).
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.release_probe();
        }
    }
}

/// Serializable view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    /// Guarded service
    pub service_name: String,
    /// Current state
    pub state: State,
    /// Failures recorded since the breaker last closed
    pub consecutive_failures: u32,
    /// Wall-clock time of the most recent failure
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// One breaker per known downstream service.
///
/// Built once at startup; breakers are never added or removed afterwards,
/// only reset.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerTable {
    breakers: BTreeMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerTable {
    /// Create a closed breaker for each service name.
    #[must_use]
    pub fn new<I, S>(services: I, config: CircuitBreakerConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let breakers = services
            .into_iter()
            .map(Into::into)
            .map(|name: String| {
                let breaker = Arc::new(CircuitBreaker::new(name.clone(), config));
                (name, breaker)
            })
            .collect();
        Self { breakers }
    }

    /// Breaker guarding `service`, if the service is known.
    #[must_use]
    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).cloned()
    }

    /// Force a breaker back to Closed. Returns `false` for unknown services.
    pub fn reset(&self, service: &str) -> bool {
        self.breakers.get(service).is_some_and(|breaker| {
            breaker.reset();
            true
        })
    }

    /// Snapshot of every breaker keyed by service.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, CircuitBreakerSnapshot> {
        self.breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.snapshot()))
            .collect()
    }

    /// Known service names in sorted order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.breakers.keys().map(String::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .cooldown(Duration::from_millis(cooldown_ms))
                .build(),
        )
    }

    fn fail(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            breaker.try_acquire().unwrap().record_failure();
        }
    }

    #[test]
    fn test_closed_on_success() {
        let breaker = breaker(3, 1_000);
        let permit = breaker.try_acquire().unwrap();

        assert!(!permit.is_probe());
        permit.record_success();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, 1_000);

        fail(&breaker, 2);
        assert_eq!(breaker.state(), State::Closed);

        fail(&breaker, 1);
        assert_eq!(breaker.state(), State::Open);
        assert_eq!(breaker.snapshot().consecutive_failures, 3);
        assert!(breaker.snapshot().last_failure_at.is_some());
    }

    #[test]
    fn test_open_breaker_rejects_with_remaining_cooldown() {
        let breaker = breaker(3, 60_000);
        fail(&breaker, 3);

        let rejected = breaker.try_acquire().unwrap_err();
        assert!(rejected.retry_after > Duration::from_secs(59));
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_successes_while_closed_do_not_reset_failures() {
        let breaker = breaker(3, 1_000);

        fail(&breaker, 2);
        breaker.try_acquire().unwrap().record_success();
        assert_eq!(breaker.snapshot().consecutive_failures, 2);

        fail(&breaker, 1);
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn test_straggler_success_keeps_breaker_open() {
        let breaker = breaker(3, 60_000);
        let slow = breaker.try_acquire().unwrap();

        fail(&breaker, 3);
        assert_eq!(breaker.state(), State::Open);

        slow.record_success();
        assert_eq!(breaker.state(), State::Open);
        assert_eq!(breaker.snapshot().consecutive_failures, 3);
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_straggler_success_does_not_settle_half_open() {
        let breaker = breaker(1, 50);
        let slow = breaker.try_acquire().unwrap();
        fail(&breaker, 1);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());

        slow.record_success();
        assert_eq!(breaker.state(), State::HalfOpen);
        assert!(breaker.try_acquire().is_err());

        probe.record_success();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_probe() {
        let breaker = breaker(1, 50);
        fail(&breaker, 1);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let probe = breaker.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), State::HalfOpen);

        let second = breaker.try_acquire().unwrap_err();
        assert_eq!(second.retry_after, Duration::ZERO);

        probe.record_success();
        assert_eq!(breaker.state(), State::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_and_restarts_cooldown() {
        let breaker = breaker(1, 100);
        fail(&breaker, 1);
        tokio::time::sleep(Duration::from_millis(130)).await;

        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.state(), State::Open);

        let rejected = breaker.try_acquire().unwrap_err();
        assert!(rejected.retry_after > Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_dropped_probe_frees_slot() {
        let breaker = breaker(1, 20);
        fail(&breaker, 1);
        tokio::time::sleep(Duration::from_millis(40)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), State::HalfOpen);

        let retry = breaker.try_acquire().unwrap();
        assert!(retry.is_probe());
        retry.record_success();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn test_recorded_success_closes_open_breaker() {
        let breaker = breaker(1, 60_000);
        fail(&breaker, 1);
        assert_eq!(breaker.state(), State::Open);

        breaker.record_success();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn test_reset() {
        let breaker = breaker(2, 60_000);
        fail(&breaker, 2);
        assert_eq!(breaker.state(), State::Open);

        breaker.reset();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, State::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_failure_at.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_not_lost() {
        let breaker = Arc::new(breaker(1_000, 60_000));
        let mut handles = vec![];

        for _ in 0..100 {
            let breaker = Arc::clone(&breaker);
            handles.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                breaker.try_acquire().unwrap().record_failure();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(breaker.snapshot().consecutive_failures, 100);
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn test_snapshot_serializes_wire_state() {
        let breaker = breaker(3, 1_000);
        let json = serde_json::to_value(breaker.snapshot()).unwrap();

        assert_eq!(json["serviceName"], "svc");
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["consecutiveFailures"], 0);
        assert!(json["lastFailureAt"].is_null());
        assert_eq!(serde_json::to_value(State::HalfOpen).unwrap(), "HALF_OPEN");
    }

    #[test]
    fn test_table_reset_and_lookup() {
        let table = CircuitBreakerTable::new(
            ["user-service", "item-service"],
            CircuitBreakerConfig::builder().failure_threshold(1).build(),
        );

        table.get("item-service").unwrap().record_failure();
        assert_eq!(table.snapshot()["item-service"].state, State::Open);

        assert!(table.reset("item-service"));
        assert!(!table.reset("unknown"));
        assert_eq!(table.snapshot()["item-service"].state, State::Closed);
        assert_eq!(
            table.service_names().collect::<Vec<_>>(),
            ["item-service", "user-service"]
        );
    }
}
