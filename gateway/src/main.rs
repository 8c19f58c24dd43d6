//! `shopmesh-gateway` binary.

use anyhow::Context;
use shopmesh_gateway::{GatewayConfig, GatewayState, router};
use shopmesh_runtime::metrics::MetricsServer;
use shopmesh_runtime::registry::{FileRegistryStore, ServiceRegistry};
use shopmesh_web::{init_tracing, shutdown_signal};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info,tower_http=info");

    let config = GatewayConfig::from_env()?;

    let mut metrics = config
        .metrics_port
        .map(|port| MetricsServer::new(SocketAddr::from(([0, 0, 0, 0], port))));
    if let Some(server) = metrics.as_mut() {
        server.start()?;
    }

    let registry = Arc::new(
        ServiceRegistry::new(Arc::new(FileRegistryStore::new(config.registry_path.clone())))
            .with_config(config.registry_config()),
    );
    let sweeper = registry.spawn_sweeper();

    let state = GatewayState::new(&config, Some(registry)).context("failed to build HTTP client")?;
    let monitor = state.prober().as_ref().clone().spawn_monitor(config.health_check_interval);

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        %addr,
        registry = %config.registry_path.display(),
        services = ?config.services,
        "API gateway listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    monitor.abort();
    tracing::info!("API gateway stopped");
    Ok(())
}
