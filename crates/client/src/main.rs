//! `fieldops-agent`: keeps the device outbox draining in the background.

use std::sync::Arc;

use anyhow::Context;
use fieldops_client::outbox::OutboxLocation;
use fieldops_client::{
    Backend, ClientConfig, ConnectivityMonitor, HttpBackend, LogNotifier, OutboxStore,
    SqliteOutbox, SyncEngine, SyncWorker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fieldops_observability::init();

    let config = ClientConfig::from_env();
    tracing::info!(api_url = %config.api_url, bucket = %config.storage_bucket, "starting fieldops agent");

    let backend = Arc::new(
        HttpBackend::new(config.backend_config()).context("failed to build HTTP client")?,
    );

    let outbox = match &config.outbox_path {
        Some(path) => SqliteOutbox::new(OutboxLocation::File(path.clone())),
        None => SqliteOutbox::open_default()?,
    };
    let outbox = Arc::new(outbox);
    let queued = outbox
        .get_all()
        .await
        .context("failed to open outbox")?
        .len();
    tracing::info!(queued, "outbox ready");

    let engine = Arc::new(
        SyncEngine::new(
            backend.clone(),
            config.image_uploader(backend.clone()),
            outbox,
            Arc::new(LogNotifier),
        )
        .with_max_retries(config.max_retries),
    );

    let connectivity = ConnectivityMonitor::offline();
    if backend.health().await {
        connectivity.set_online();
    }

    let worker = SyncWorker::new(engine, backend, connectivity)
        .with_probe_interval(config.probe_interval);
    let shutdown = worker.shutdown_handle();
    let handle = worker.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    shutdown.notify_one();
    handle.await.context("sync worker panicked")?;

    Ok(())
}
