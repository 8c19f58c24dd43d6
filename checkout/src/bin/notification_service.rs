//! `notification-service` binary: sends a receipt for every checkout.

use axum::Router;
use shopmesh_checkout::{
    LogNotifier, NotificationHandler, WorkerConfig, WorkerKind, checkout_handler, worker,
};
use shopmesh_web::init_tracing;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info,tower_http=info");

    let config = WorkerConfig::from_env(WorkerKind::Notification)?;
    let notifier = Arc::new(LogNotifier::with_delay(Duration::from_secs(1)));
    let handler = Arc::new(NotificationHandler::new(notifier));

    worker::run(config, checkout_handler(handler), Router::new()).await
}
