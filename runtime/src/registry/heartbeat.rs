//! Keep a service's own registry entry alive.
//!
//! A service registers on startup, reports itself healthy on a fixed
//! interval (so the sweep never evicts it) and unregisters on graceful
//! shutdown. If its entry disappears in between (swept while the process was
//! paused, or lost to another process's write) the next beat registers it
//! again.

use shopmesh_core::ServiceRegistration;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{RegistryError, ServiceRegistry};

/// Registration plus periodic health reports for one service.
#[derive(Debug)]
pub struct RegistryHeartbeat {
    registry: Arc<ServiceRegistry>,
    name: String,
    registration: ServiceRegistration,
    interval: Duration,
}

impl RegistryHeartbeat {
    /// Heartbeat for `name` every 30 seconds.
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        name: impl Into<String>,
        registration: ServiceRegistration,
    ) -> Self {
        Self {
            registry,
            name: name.into(),
            registration,
            interval: Duration::from_secs(30),
        }
    }

    /// Override the reporting interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Register now and start reporting in the background.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the initial registration fails.
    pub async fn start(self) -> Result<HeartbeatHandle, RegistryError> {
        self.registry
            .register(self.name.clone(), self.registration.clone())
            .await?;

        let registry = Arc::clone(&self.registry);
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            let period = self.interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                self.beat().await;
            }
        });

        Ok(HeartbeatHandle {
            registry,
            name,
            task,
        })
    }

    async fn beat(&self) {
        match self.registry.update_health(&self.name, true).await {
            Ok(true) => tracing::trace!(service = %self.name, "Heartbeat sent"),
            Ok(false) => {
                tracing::warn!(service = %self.name, "Registry entry missing, re-registering");
                if let Err(error) = self
                    .registry
                    .register(self.name.clone(), self.registration.clone())
                    .await
                {
                    tracing::error!(service = %self.name, error = %error, "Re-registration failed");
                }
            }
            Err(error) => {
                tracing::warn!(service = %self.name, error = %error, "Heartbeat failed");
            }
        }
    }
}

/// Running heartbeat. Call [`stop`](Self::stop) on graceful shutdown.
#[derive(Debug)]
pub struct HeartbeatHandle {
    registry: Arc<ServiceRegistry>,
    name: String,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop reporting and remove the registry entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the entry cannot be removed.
    pub async fn stop(self) -> Result<bool, RegistryError> {
        self.task.abort();
        self.registry.unregister(&self.name).await
    }
}
