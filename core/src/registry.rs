//! Service descriptors as persisted in the shared registry document.
//!
//! The document is a JSON object keyed by service name. Field names are
//! camelCase so that other processes reading the same file (including ones not
//! written in Rust) see the familiar shape:
//!
//! ```json
//! {
//!   "list-service": {
//!     "url": "http://localhost:3002",
//!     "version": "1.0.0",
//!     "endpoints": ["/health", "/lists"],
//!     "registeredAt": "2025-01-01T12:00:00Z",
//!     "lastHealthCheck": "2025-01-01T12:00:30Z",
//!     "healthy": true
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The full registry document: service name to descriptor.
///
/// A `BTreeMap` keeps the persisted file in a stable order.
pub type RegistryDocument = BTreeMap<String, ServiceDescriptor>;

/// One registered service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    /// Base URL requests are forwarded to (e.g. `http://localhost:3002`)
    #[serde(rename = "url", alias = "baseUrl")]
    pub base_url: String,
    /// Reported service version
    #[serde(default = "default_version")]
    pub version: String,
    /// Whether the last heartbeat or probe reported the service as healthy
    pub healthy: bool,
    /// When the service first registered (or last re-registered)
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat or health update
    pub last_health_check: DateTime<Utc>,
    /// Advertised endpoints, informational only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    /// Free-form metadata supplied at registration
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl ServiceDescriptor {
    /// Whether the descriptor has gone without a health update for longer
    /// than `staleness` as of `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_health_check) > staleness
    }
}

/// What a service submits when it registers.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use shopmesh_core::registry::ServiceRegistration;
///
/// let descriptor = ServiceRegistration::new("http://localhost:3002")
///     .with_version("2.1.0")
///     .with_endpoint("/lists")
///     .into_descriptor(Utc::now());
///
/// assert!(descriptor.healthy);
/// assert_eq!(descriptor.version, "2.1.0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceRegistration {
    base_url: String,
    version: Option<String>,
    endpoints: Vec<String>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl ServiceRegistration {
    /// Start a registration for a service reachable at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Set the reported version (defaults to `1.0.0`).
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Advertise an endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Base URL being registered.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Turn the registration into a fresh, healthy descriptor stamped `now`.
    #[must_use]
    pub fn into_descriptor(self, now: DateTime<Utc>) -> ServiceDescriptor {
        ServiceDescriptor {
            base_url: self.base_url,
            version: self.version.unwrap_or_else(default_version),
            healthy: true,
            registered_at: now,
            last_health_check: now,
            endpoints: self.endpoints,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn descriptor_persists_with_camel_case_keys() {
        let descriptor = ServiceRegistration::new("http://localhost:3003").into_descriptor(at(0));
        let json = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(json["url"], "http://localhost:3003");
        assert_eq!(json["version"], "1.0.0");
        assert_eq!(json["healthy"], true);
        assert!(json.get("registeredAt").is_some());
        assert!(json.get("lastHealthCheck").is_some());
        assert!(json.get("endpoints").is_none());
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn reads_documents_written_by_other_processes() {
        let raw = serde_json::json!({
            "user-service": {
                "url": "http://localhost:3001",
                "version": "1.0.0",
                "endpoints": ["/auth/login", "/users"],
                "registeredAt": "2025-01-01T12:00:00.000Z",
                "lastHealthCheck": "2025-01-01T12:00:30.000Z",
                "healthy": false
            }
        });

        let document: RegistryDocument = serde_json::from_value(raw).unwrap();
        let user = &document["user-service"];
        assert_eq!(user.base_url, "http://localhost:3001");
        assert_eq!(user.endpoints.len(), 2);
        assert!(!user.healthy);
    }

    #[test]
    fn staleness_is_measured_from_last_health_check() {
        let mut descriptor = ServiceRegistration::new("http://x").into_descriptor(at(0));
        let two_minutes = chrono::Duration::seconds(120);

        assert!(!descriptor.is_stale(at(120), two_minutes));
        assert!(descriptor.is_stale(at(121), two_minutes));

        descriptor.last_health_check = at(100);
        assert!(!descriptor.is_stale(at(200), two_minutes));
    }
}
