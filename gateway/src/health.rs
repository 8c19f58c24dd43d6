//! Downstream health probing.
//!
//! Probes call each service's `GET /health` directly: breaker admission is
//! skipped so an open breaker can still be observed recovering, but every
//! outcome is recorded into the breaker.

use futures::future::join_all;
use serde::Serialize;
use shopmesh_runtime::circuit_breaker::CircuitBreakerSnapshot;
use shopmesh_runtime::health::HealthStatus;
use shopmesh_web::ServiceInfo;
use shopmesh_web::handlers::ServiceHealth;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::dispatch::Dispatcher;

/// Result of probing one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceProbe {
    /// `healthy` or `unhealthy`
    pub status: HealthStatus,
    /// The service's own health payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Why the probe failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where the probed address came from
    pub source: &'static str,
}

impl ServiceProbe {
    fn unhealthy(error: impl Into<String>, source: &'static str) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            data: None,
            error: Some(error.into()),
            source,
        }
    }
}

/// State of the shared registry as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryStatus {
    /// At least one service is registered
    Active,
    /// The registry is readable but empty
    Empty,
    /// The registry could not be read (or discovery is disabled)
    Unavailable,
}

/// `GET /health` payload of the gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHealth {
    /// The gateway's own liveness
    pub gateway: ServiceHealth,
    /// Probe result per downstream service
    pub services: BTreeMap<String, ServiceProbe>,
    /// Breaker table after the probes were recorded
    pub circuit_breakers: BTreeMap<String, CircuitBreakerSnapshot>,
    /// Registry state
    pub registry_status: RegistryStatus,
}

/// Probes every service the gateway has a breaker for.
#[derive(Debug, Clone)]
pub struct HealthProber {
    dispatcher: Arc<Dispatcher>,
    timeout: Duration,
}

impl HealthProber {
    /// Prober with a per-probe timeout.
    #[must_use]
    pub const fn new(dispatcher: Arc<Dispatcher>, timeout: Duration) -> Self {
        Self { dispatcher, timeout }
    }

    /// Probe one service and record the outcome into its breaker.
    pub async fn probe(&self, service: &str) -> ServiceProbe {
        let resolution = match self.dispatcher.resolve(service).await {
            Ok(resolution) => resolution,
            Err(error) => return ServiceProbe::unhealthy(error.to_string(), "unresolved"),
        };
        let source = resolution.source.as_str();
        let url = format!("{}/health", resolution.base_url);

        let request = self.dispatcher.client().get(&url).timeout(self.timeout);
        let outcome = match request.send().await {
            Ok(response) if response.status().is_success() => match response.bytes().await {
                Ok(body) => Ok(health_body(service, &body)),
                Err(error) => Err(error.to_string()),
            },
            Ok(response) => Err(format!("health endpoint responded with {}", response.status())),
            Err(error) if error.is_timeout() => {
                Err(format!("timed out after {}ms", self.timeout.as_millis()))
            }
            Err(error) => Err(error.to_string()),
        };

        let breaker = self.dispatcher.breakers().get(service);
        match outcome {
            Ok(data) => {
                if let Some(breaker) = breaker {
                    breaker.record_success();
                }
                ServiceProbe {
                    status: HealthStatus::Healthy,
                    data: Some(data),
                    error: None,
                    source,
                }
            }
            Err(error) => {
                tracing::warn!(service, error = %error, "Health probe failed");
                if let Some(breaker) = breaker {
                    breaker.record_failure();
                }
                ServiceProbe::unhealthy(error, source)
            }
        }
    }

    /// Probe every known service concurrently.
    pub async fn probe_all(&self) -> BTreeMap<String, ServiceProbe> {
        let services: Vec<String> = self
            .dispatcher
            .breakers()
            .service_names()
            .map(ToString::to_string)
            .collect();

        let probes = join_all(services.iter().map(|service| self.probe(service))).await;
        services.into_iter().zip(probes).collect()
    }

    /// Probe everything and assemble the gateway health report.
    pub async fn report(&self, info: &ServiceInfo) -> GatewayHealth {
        let services = self.probe_all().await;

        let registry_status = match self.dispatcher.registry() {
            Some(registry) => match registry.list().await {
                Ok(document) if document.is_empty() => RegistryStatus::Empty,
                Ok(_) => RegistryStatus::Active,
                Err(error) => {
                    tracing::warn!(error = %error, "Registry unreadable during health check");
                    RegistryStatus::Unavailable
                }
            },
            None => RegistryStatus::Unavailable,
        };

        GatewayHealth {
            gateway: ServiceHealth::new(info, Vec::new()),
            services,
            circuit_breakers: self.dispatcher.breakers().snapshot(),
            registry_status,
        }
    }

    /// Re-probe every `interval` in the background, starting one interval
    /// from now.
    #[must_use]
    pub fn spawn_monitor(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let probes = self.probe_all().await;
                let healthy = probes.values().filter(|p| p.status.is_healthy()).count();
                tracing::debug!(healthy, total = probes.len(), "Background health check complete");
            }
        })
    }
}

/// Decode a health body, keeping non-JSON text as a string.
fn health_body(service: &str, body: &[u8]) -> serde_json::Value {
    match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(service, error = %error, "Health body is not JSON");
            serde_json::Value::String(String::from_utf8_lossy(body).into_owned())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn probe_serializes_either_data_or_error() {
        let healthy = ServiceProbe {
            status: HealthStatus::Healthy,
            data: Some(serde_json::json!({ "status": "healthy" })),
            error: None,
            source: "direct",
        };
        assert_eq!(
            serde_json::to_value(&healthy).unwrap(),
            serde_json::json!({
                "status": "healthy",
                "data": { "status": "healthy" },
                "source": "direct"
            })
        );

        let failed = ServiceProbe::unhealthy("connection refused", "registry");
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({
                "status": "unhealthy",
                "error": "connection refused",
                "source": "registry"
            })
        );
    }

    #[test]
    fn non_json_health_body_is_kept_as_text() {
        assert_eq!(health_body("item-service", b"OK"), serde_json::json!("OK"));
        assert_eq!(health_body("item-service", b""), serde_json::json!(""));
        assert_eq!(
            health_body("item-service", br#"{"status":"healthy"}"#),
            serde_json::json!({ "status": "healthy" })
        );
    }

    #[test]
    fn registry_status_is_lowercase() {
        assert_eq!(serde_json::to_value(RegistryStatus::Unavailable).unwrap(), "unavailable");
    }
}
