//! Gateway configuration loaded from environment variables.

use serde::{Deserialize, Serialize};
use shopmesh_core::config::{ConfigError, Env, process_env};
use shopmesh_runtime::circuit_breaker::CircuitBreakerConfig;
use shopmesh_runtime::registry::RegistryConfig;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Name the gateway reports in headers, errors and health.
pub const GATEWAY_SERVICE: &str = "api-gateway";

/// Version the gateway reports.
pub const GATEWAY_VERSION: &str = "1.0.0";

/// Downstream service owning users and authentication.
pub const USER_SERVICE: &str = "user-service";

/// Downstream service owning shopping lists.
pub const LIST_SERVICE: &str = "list-service";

/// Downstream service owning the item catalog.
pub const ITEM_SERVICE: &str = "item-service";

/// Gateway settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Static service name → base URL map, consulted before the registry
    pub services: BTreeMap<String, String>,
    /// Failures that open a breaker
    pub failure_threshold: u32,
    /// How long an open breaker rejects before probing
    pub cooldown: Duration,
    /// Timeout for proxied requests
    pub proxy_timeout: Duration,
    /// Timeout for `/health` probes
    pub health_timeout: Duration,
    /// Timeout for each dashboard/search sub-call
    pub aggregate_timeout: Duration,
    /// Interval of the background health monitor
    pub health_check_interval: Duration,
    /// Shared registry document
    pub registry_path: PathBuf,
    /// Registry sweep interval
    pub registry_sweep_interval: Duration,
    /// Entries without a health update for this long are swept
    pub registry_staleness: Duration,
    /// Prometheus exporter port (disabled when unset)
    pub metrics_port: Option<u16>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            services: default_services(),
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            proxy_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(3),
            aggregate_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            registry_path: PathBuf::from("service-registry.json"),
            registry_sweep_interval: Duration::from_secs(60),
            registry_staleness: Duration::from_secs(120),
            metrics_port: None,
        }
    }
}

fn default_services() -> BTreeMap<String, String> {
    BTreeMap::from([
        (USER_SERVICE.to_string(), "http://localhost:3001".to_string()),
        (LIST_SERVICE.to_string(), "http://localhost:3002".to_string()),
        (ITEM_SERVICE.to_string(), "http://localhost:3003".to_string()),
    ])
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env())
    }

    /// Load configuration from an arbitrary key/value source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a numeric variable does not parse.
    pub fn from_lookup<F>(env: &Env<F>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            env.parse(key, default.as_secs()).map(Duration::from_secs)
        };

        let mut services = defaults.services.clone();
        for (name, key) in [
            (USER_SERVICE, "USER_SERVICE_URL"),
            (LIST_SERVICE, "LIST_SERVICE_URL"),
            (ITEM_SERVICE, "ITEM_SERVICE_URL"),
        ] {
            if let Some(url) = env.optional(key) {
                services.insert(name.to_string(), url);
            }
        }

        Ok(Self {
            host: env.string("GATEWAY_HOST", &defaults.host),
            port: env.parse("GATEWAY_PORT", defaults.port)?,
            services,
            failure_threshold: env
                .parse("CIRCUIT_BREAKER_FAILURE_THRESHOLD", defaults.failure_threshold)?,
            cooldown: secs("CIRCUIT_BREAKER_COOLDOWN_SECS", defaults.cooldown)?,
            proxy_timeout: secs("PROXY_TIMEOUT_SECS", defaults.proxy_timeout)?,
            health_timeout: secs("HEALTH_TIMEOUT_SECS", defaults.health_timeout)?,
            aggregate_timeout: secs("AGGREGATE_TIMEOUT_SECS", defaults.aggregate_timeout)?,
            health_check_interval: secs(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval,
            )?,
            registry_path: env
                .optional("REGISTRY_PATH")
                .map_or(defaults.registry_path, PathBuf::from),
            registry_sweep_interval: secs(
                "REGISTRY_SWEEP_INTERVAL_SECS",
                defaults.registry_sweep_interval,
            )?,
            registry_staleness: secs("REGISTRY_STALENESS_SECS", defaults.registry_staleness)?,
            metrics_port: env.parse_optional("METRICS_PORT")?,
        })
    }

    /// `host:port` to bind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the host is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            key: "GATEWAY_HOST".to_string(),
            value: raw,
            reason: e.to_string(),
        })
    }

    /// Breaker settings for every downstream service.
    #[must_use]
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.failure_threshold)
            .cooldown(self.cooldown)
            .build()
    }

    /// Registry timing.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            staleness: chrono::Duration::from_std(self.registry_staleness)
                .unwrap_or_else(|_| chrono::Duration::minutes(2)),
            sweep_interval: self.registry_sweep_interval,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&'static str, &'static str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<&str, &str> = pairs.iter().copied().collect();
        GatewayConfig::from_lookup(&Env::new(|key: &str| vars.get(key).map(|v| (*v).to_string())))
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.services[ITEM_SERVICE], "http://localhost:3003");
        assert_eq!(config.bind_addr().unwrap().port(), 3000);
    }

    #[test]
    fn service_urls_and_timeouts_are_overridable() {
        let config = load(&[
            ("ITEM_SERVICE_URL", "http://svc:3003"),
            ("CIRCUIT_BREAKER_COOLDOWN_SECS", "5"),
            ("METRICS_PORT", "9090"),
        ])
        .unwrap();

        assert_eq!(config.services[ITEM_SERVICE], "http://svc:3003");
        assert_eq!(config.services[USER_SERVICE], "http://localhost:3001");
        assert_eq!(config.breaker_config().cooldown, Duration::from_secs(5));
        assert_eq!(config.metrics_port, Some(9090));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        assert!(load(&[("GATEWAY_PORT", "http")]).is_err());
        assert!(load(&[("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "-1")]).is_err());
    }

    #[test]
    fn registry_timing_follows_config() {
        let config = load(&[("REGISTRY_STALENESS_SECS", "30")]).unwrap();
        assert_eq!(config.registry_config().staleness, chrono::Duration::seconds(30));
    }
}
