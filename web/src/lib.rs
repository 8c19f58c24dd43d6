//! Axum glue shared by the shopmesh HTTP services.
//!
//! The gateway and the checkout workers all speak the same HTTP dialect:
//! JSON error bodies with a `success: false` envelope, a correlation ID on
//! every request, `X-Service` headers on every response, and a `GET /health`
//! endpoint.
//!
//! # Example
//!
//! ```
//! use axum::{Router, routing::get};
//! use shopmesh_web::handlers::health_report;
//! use shopmesh_web::{ServiceInfo, correlation_id_layer, service_headers_layer};
//! use std::sync::Arc;
//!
//! let info = Arc::new(ServiceInfo::new("analytics-service", "1.0.0"));
//! let health = move || {
//!     let info = Arc::clone(&info);
//!     async move { health_report(&info, Vec::new()) }
//! };
//! let app: Router = Router::new()
//!     .route("/health", get(health))
//!     .layer(service_headers_layer("analytics-service", "1.0.0"))
//!     .layer(correlation_id_layer());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod state;
pub mod telemetry;

// Re-export key types for convenience
pub use error::AppError;
pub use extractors::{BearerToken, CorrelationId};
pub use middleware::{
    CORRELATION_ID_HEADER, CorrelationIdExt, SERVICE_HEADER, SERVICE_VERSION_HEADER,
    correlation_id_layer, service_headers_layer,
};
pub use state::ServiceInfo;
pub use telemetry::{init_tracing, shutdown_signal};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
