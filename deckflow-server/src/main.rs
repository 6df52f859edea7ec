use std::sync::Arc;

use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use deckflow_core::config::Settings;
use deckflow_core::gpu::HttpGpuClient;
use deckflow_core::pipeline::{DriverConfig, PipelineDriver};
use deckflow_core::queue::QueueManager;
use deckflow_core::recovery::HeartbeatLoop;
use deckflow_core::store::PipelineStore;
use deckflow_core::store_postgres::PostgresPipelineStore;
use deckflow_core::types::ServerType;

use deckflow_server::routes::{internal_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let settings = Settings::from_env()?;

    tracing::info!("Connecting to PostgreSQL...");
    let pool = sqlx::PgPool::connect(&settings.database_url).await?;
    let pg = PostgresPipelineStore::new(pool);
    pg.migrate().await?;
    tracing::info!("Using PostgresPipelineStore (migrations applied)");
    let store: Arc<dyn PipelineStore> = Arc::new(pg);

    let queue = Arc::new(QueueManager::new(
        store.clone(),
        ServerType::Cpu,
        settings.lease,
        settings.backoff,
        settings.max_concurrent_tasks,
    ));

    // Startup protocol: announce this worker, then reclaim anything a dead
    // predecessor left mid-flight.
    queue.register_server().await?;
    let recovered = queue.recover_abandoned_tasks().await?;
    if recovered > 0 {
        tracing::info!(recovered, "recovered abandoned tasks at startup");
    }

    let gpu: Arc<dyn deckflow_core::gpu::GpuAnalysis> =
        Arc::new(HttpGpuClient::new(settings.gpu_base_url.clone()));
    if !gpu.health().await {
        tracing::warn!(gpu_base_url = %settings.gpu_base_url, "GPU service not reachable at startup");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One driver per concurrency slot, all pulling from the shared queue.
    for slot in 0..settings.max_concurrent_tasks {
        let driver = PipelineDriver::new(
            store.clone(),
            queue.clone(),
            gpu.clone(),
            DriverConfig {
                backend_base_url: settings.backend_base_url.clone(),
                shared_mount_path: settings.shared_mount_path.clone(),
                poll_interval: settings.poll_interval,
            },
        );
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            tracing::debug!(slot, "driver slot started");
            driver.run(rx).await;
        });
    }

    let heartbeat = HeartbeatLoop::new(queue.clone(), settings.heartbeat_interval);
    let hb_rx = shutdown_rx.clone();
    tokio::spawn(async move { heartbeat.run(hb_rx).await });

    let app = internal_router(AppState { store, queue }).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(bind_addr = %settings.bind_addr, "internal API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Stop the background loops after the HTTP server drains.
    let _ = shutdown_tx.send(true);

    Ok(())
}
