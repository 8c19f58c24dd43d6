//! Health check endpoints.
//!
//! Every shopmesh service answers `GET /health`. The gateway probes these
//! endpoints and nests the same [`ServiceHealth`] shape for itself in its
//! aggregate report.

use axum::{Json, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopmesh_runtime::health::{HealthCheck, HealthStatus};

use crate::state::ServiceInfo;

/// Liveness payload of one service.
///
/// ```json
/// {
///   "service": "notification-service",
///   "status": "healthy",
///   "version": "1.0.0",
///   "timestamp": "2025-01-01T00:00:00Z",
///   "uptime": 42.5
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    /// Service name
    pub service: String,
    /// Overall status
    pub status: HealthStatus,
    /// Service version
    pub version: String,
    /// Time of the report
    pub timestamp: DateTime<Utc>,
    /// Seconds since start
    pub uptime: f64,
    /// Dependency checks, when the service reports any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<HealthCheck>,
}

impl ServiceHealth {
    /// Report for `info`, summarizing `checks`.
    #[must_use]
    pub fn new(info: &ServiceInfo, checks: Vec<HealthCheck>) -> Self {
        Self {
            service: info.name().to_string(),
            status: HealthStatus::summarize(checks.iter().map(|c| c.status)),
            version: info.version().to_string(),
            timestamp: Utc::now(),
            uptime: info.uptime().as_secs_f64(),
            checks,
        }
    }
}

/// Health report with dependency checks.
///
/// # Status Codes
///
/// - 200 OK: Healthy or Degraded
/// - 503 Service Unavailable: Unhealthy
#[must_use]
pub fn health_report(
    info: &ServiceInfo,
    checks: Vec<HealthCheck>,
) -> (StatusCode, Json<ServiceHealth>) {
    let health = ServiceHealth::new(info, checks);

    let status = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passing_checks_are_ok() {
        let info = ServiceInfo::new("notification-service", "1.0.0");
        let (status, Json(health)) =
            health_report(&info, vec![HealthCheck::healthy("consumer:notification_queue")]);

        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.service, "notification-service");
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.checks.len(), 1);
    }

    #[test]
    fn test_failed_dependency_is_unavailable() {
        let info = ServiceInfo::new("analytics-service", "1.0.0");
        let (status, Json(health)) =
            health_report(&info, vec![HealthCheck::unhealthy("consumer", "not subscribed")]);

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(health.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_payload_shape() {
        let info = ServiceInfo::new("api-gateway", "1.0.0");
        let value = serde_json::to_value(ServiceHealth::new(&info, Vec::new())).unwrap_or_default();

        assert_eq!(value["service"], "api-gateway");
        assert_eq!(value["status"], "healthy");
        assert!(value["uptime"].is_number());
        assert!(value.get("checks").is_none());
    }
}
