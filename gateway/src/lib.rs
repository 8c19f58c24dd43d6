//! # Shopmesh Gateway
//!
//! The single entry point in front of the user, list and item services.
//!
//! - **Proxying**: `/api/{auth,users,lists,items}/*` forwarded through a
//!   declarative [`RouteTable`](routes::RouteTable), guarded by one circuit
//!   breaker per service
//! - **Resolution**: static service map first, service registry second
//! - **Aggregates**: `/api/dashboard` and `/api/search` fan out to several
//!   services and return partial results when one of them fails
//! - **Operations**: `/health`, `/registry`, `/circuit-breaker/reset`
//!
//! ## Example
//!
//! ```no_run
//! use shopmesh_gateway::{GatewayConfig, GatewayState, router};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = GatewayConfig::from_env()?;
//! let state = GatewayState::new(&config, None)?;
//! let listener = tokio::net::TcpListener::bind(config.bind_addr()?).await?;
//! axum::serve(listener, router(state)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod routes;
pub mod server;

pub use config::GatewayConfig;
pub use dispatch::{Dispatcher, ProxyRequest, ProxyResponse};
pub use error::GatewayError;
pub use server::{GatewayState, router};
