//! `analytics-service` binary: running checkout statistics on `GET /stats`.

use shopmesh_checkout::analytics::stats_router;
use shopmesh_checkout::{AnalyticsHandler, WorkerConfig, WorkerKind, checkout_handler, worker};
use shopmesh_web::init_tracing;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info,tower_http=info");

    let config = WorkerConfig::from_env(WorkerKind::Analytics)?;
    let analytics = Arc::new(AnalyticsHandler::new());

    worker::run(config, checkout_handler(Arc::clone(&analytics)), stats_router(analytics)).await
}
