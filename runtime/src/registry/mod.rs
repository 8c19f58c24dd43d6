//! Service registry: register, discover, health updates and liveness sweeps.
//!
//! The registry is a thin layer of read-modify-write operations over a
//! [`RegistryStore`]. Within a process the writes are serialized by a mutex.
//! Between processes sharing a [`FileRegistryStore`] the last writer wins; an
//! update lost that way is repaired by the owner's next heartbeat.
//!
//! # Example
//!
//! ```rust
//! use shopmesh_core::ServiceRegistration;
//! use shopmesh_runtime::registry::{InMemoryRegistryStore, ServiceRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ServiceRegistry::new(Arc::new(InMemoryRegistryStore::new()));
//!
//! registry
//!     .register("item-service", ServiceRegistration::new("http://localhost:3003"))
//!     .await?;
//!
//! let descriptor = registry.discover("item-service").await?;
//! assert_eq!(descriptor.base_url, "http://localhost:3003");
//! # Ok(())
//! # }
//! ```

mod heartbeat;
mod store;

pub use heartbeat::{HeartbeatHandle, RegistryHeartbeat};
pub use store::{FileRegistryStore, InMemoryRegistryStore, RegistryError, RegistryStore};

use chrono::{DateTime, Utc};
use shopmesh_core::{Clock, RegistryDocument, ServiceDescriptor, ServiceRegistration, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::metrics::RegistryMetrics;

/// Why [`ServiceRegistry::discover`] could not return a descriptor.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// No service is registered under this name
    #[error("Service '{service}' is not registered")]
    NotFound {
        /// Requested service
        service: String,
    },

    /// The service is registered but reported unhealthy
    #[error("Service '{service}' is registered but unhealthy")]
    Unhealthy {
        /// Requested service
        service: String,
        /// Last health report
        last_health_check: DateTime<Utc>,
    },

    /// The registry could not be read
    #[error(transparent)]
    Store(#[from] RegistryError),
}

impl DiscoveryError {
    /// Whether the failure may clear up on its own.
    ///
    /// `NotFound` points at configuration; the others at a service or
    /// storage hiccup.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }
}

/// Registry timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Entries without a health update for longer than this are swept
    pub staleness: chrono::Duration,
    /// How often the background sweeper runs
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness: chrono::Duration::minutes(2),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Read/write/expire operations over a [`RegistryStore`].
pub struct ServiceRegistry {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Registry over `store` using the system clock and default timing.
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config: RegistryConfig::default(),
            write_lock: Mutex::new(()),
        }
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the timing configuration.
    #[must_use]
    pub const fn with_config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Timing configuration.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register (or re-register) `name`, overwriting any previous entry.
    ///
    /// The new descriptor is healthy and stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be read or written.
    pub async fn register(
        &self,
        name: impl Into<String>,
        registration: ServiceRegistration,
    ) -> Result<ServiceDescriptor, RegistryError> {
        let name = name.into();
        let descriptor = registration.into_descriptor(self.clock.now());

        let _guard = self.write_lock.lock().await;
        let mut document = self.store.load().await?;
        document.insert(name.clone(), descriptor.clone());
        self.store.replace(document).await?;
        RegistryMetrics::record_write("register");

        tracing::info!(
            service = %name,
            url = %descriptor.base_url,
            version = %descriptor.version,
            "Service registered"
        );
        Ok(descriptor)
    }

    /// Look up a healthy service.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::NotFound`] for an unknown name,
    /// [`DiscoveryError::Unhealthy`] for a registered but unhealthy one, and
    /// [`DiscoveryError::Store`] if the registry cannot be read.
    pub async fn discover(&self, name: &str) -> Result<ServiceDescriptor, DiscoveryError> {
        let mut document = self.store.load().await?;

        match document.remove(name) {
            None => Err(DiscoveryError::NotFound {
                service: name.to_string(),
            }),
            Some(descriptor) if !descriptor.healthy => Err(DiscoveryError::Unhealthy {
                service: name.to_string(),
                last_health_check: descriptor.last_health_check,
            }),
            Some(descriptor) => Ok(descriptor),
        }
    }

    /// Set `healthy` and bump `last_health_check`.
    ///
    /// Returns `false` without writing if `name` is not registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be read or written.
    pub async fn update_health(&self, name: &str, healthy: bool) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.store.load().await?;

        let Some(descriptor) = document.get_mut(name) else {
            tracing::debug!(service = %name, "Health update for unknown service ignored");
            return Ok(false);
        };

        let was_healthy = descriptor.healthy;
        descriptor.healthy = healthy;
        descriptor.last_health_check = self.clock.now();
        self.store.replace(document).await?;
        RegistryMetrics::record_write("update_health");

        if was_healthy != healthy {
            tracing::info!(service = %name, healthy, "Service health changed");
        }
        Ok(true)
    }

    /// Snapshot of every descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be read.
    pub async fn list(&self) -> Result<RegistryDocument, RegistryError> {
        self.store.load().await
    }

    /// Remove `name`. Returns whether an entry was removed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be read or written.
    pub async fn unregister(&self, name: &str) -> Result<bool, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.store.load().await?;

        if document.remove(name).is_none() {
            return Ok(false);
        }
        self.store.replace(document).await?;
        RegistryMetrics::record_write("unregister");

        tracing::info!(service = %name, "Service unregistered");
        Ok(true)
    }

    /// Evict every descriptor whose last health update is older than the
    /// staleness window, whatever its `healthy` flag says.
    ///
    /// Returns the evicted names.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the store cannot be read or written.
    pub async fn sweep(&self) -> Result<Vec<String>, RegistryError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.store.load().await?;
        let now = self.clock.now();

        let stale: Vec<String> = document
            .iter()
            .filter(|(_, descriptor)| descriptor.is_stale(now, self.config.staleness))
            .map(|(name, _)| name.clone())
            .collect();

        if stale.is_empty() {
            return Ok(stale);
        }

        for name in &stale {
            if let Some(descriptor) = document.remove(name) {
                tracing::warn!(
                    service = %name,
                    last_health_check = %descriptor.last_health_check,
                    "Evicting stale service"
                );
            }
        }
        self.store.replace(document).await?;
        RegistryMetrics::record_write("sweep");
        RegistryMetrics::record_evictions(stale.len());

        Ok(stale)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the task is
    /// aborted. The first sweep happens one interval after spawning.
    #[must_use = "dropping the handle does not stop the sweeper; abort it"]
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = registry.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(error) = registry.sweep().await {
                    tracing::error!(error = %error, "Registry sweep failed");
                }
            }
        })
    }
}
