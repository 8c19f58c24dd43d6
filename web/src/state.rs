//! Identity shared by a service's HTTP handlers.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Name, version and start time of the running service.
///
/// Handlers receive it as `State<Arc<ServiceInfo>>`; applications with
/// richer state implement `FromRef` for it.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    name: String,
    version: String,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ServiceInfo {
    /// Identity for a service starting now.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Service name, e.g. `api-gateway`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// When the process started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Time since start.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_is_clone() {
        fn assert_clone<T: Clone + Send + Sync>() {}
        assert_clone::<ServiceInfo>();
    }

    #[test]
    fn test_uptime_starts_near_zero() {
        let info = ServiceInfo::new("analytics-service", "1.0.0");
        assert_eq!(info.name(), "analytics-service");
        assert!(info.uptime() < Duration::from_secs(5));
    }
}
