//! Gateway error taxonomy and its HTTP mapping.

use shopmesh_runtime::circuit_breaker::State;
use shopmesh_runtime::registry::RegistryError;
use shopmesh_web::AppError;
use std::time::Duration;
use thiserror::Error;

/// Why the gateway could not produce an upstream response.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The target's breaker rejected the call without contacting it
    #[error("Circuit breaker for {service} is {}", state.as_str())]
    CircuitOpen {
        /// Target service
        service: String,
        /// Breaker state at rejection time
        state: State,
        /// Remaining cooldown
        retry_after: Duration,
    },

    /// Neither the static map nor the registry knows a healthy address
    #[error("Service {service} not found: {reason}")]
    ServiceNotFound {
        /// Target service
        service: String,
        /// Why resolution failed
        reason: String,
    },

    /// The request never produced an upstream response (timeout, refused, reset)
    #[error("Request to {service} failed: {reason}")]
    Upstream {
        /// Target service
        service: String,
        /// Transport error
        reason: String,
    },

    /// A resolved base URL could not be combined with the request path
    #[error("Invalid target URL for {service}: {url}")]
    InvalidTarget {
        /// Target service
        service: String,
        /// Offending URL
        url: String,
    },

    /// The registry could not be read
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl GatewayError {
    /// The service the error concerns, if any.
    #[must_use]
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen { service, .. }
            | Self::ServiceNotFound { service, .. }
            | Self::Upstream { service, .. }
            | Self::InvalidTarget { service, .. } => Some(service),
            Self::Registry(_) => None,
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::CircuitOpen {
                service,
                state,
                retry_after,
            } => Self::unavailable("Service temporarily unavailable")
                .with_service(service)
                .with_detail("circuitBreaker", state.as_str())
                .with_retry_after(retry_after),
            GatewayError::ServiceNotFound { service, reason } => {
                Self::unavailable(format!("Service {service} not found"))
                    .with_service(service)
                    .with_detail("error", reason)
            }
            GatewayError::Upstream { service, reason } => {
                Self::unavailable("Service temporarily unavailable")
                    .with_service(service)
                    .with_detail("error", reason)
            }
            error @ GatewayError::InvalidTarget { .. } => {
                let service = error.service().map(ToString::to_string);
                let app = Self::internal("Gateway misconfiguration").with_source(error.into());
                match service {
                    Some(service) => app.with_service(service),
                    None => app,
                }
            }
            error @ GatewayError::Registry(_) => {
                Self::unavailable("Service registry unavailable").with_source(error.into())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn open_circuit_maps_to_503_with_state() {
        let app: AppError = GatewayError::CircuitOpen {
            service: "item-service".to_string(),
            state: State::Open,
            retry_after: Duration::from_secs(20),
        }
        .into();

        assert_eq!(app.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(app.message(), "Service temporarily unavailable");
    }

    #[test]
    fn unknown_service_maps_to_503() {
        let app: AppError = GatewayError::ServiceNotFound {
            service: "cart-service".to_string(),
            reason: "Service 'cart-service' is not registered".to_string(),
        }
        .into();

        assert_eq!(app.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(app.message(), "Service cart-service not found");
    }

    #[test]
    fn bad_target_is_internal() {
        let app: AppError = GatewayError::InvalidTarget {
            service: "item-service".to_string(),
            url: "not a url".to_string(),
        }
        .into();
        assert_eq!(app.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
