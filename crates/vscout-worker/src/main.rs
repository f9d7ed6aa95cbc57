//! Video analysis pipeline worker binary.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use vscout_firestore::FirestoreClient;
use vscout_media::{check_ffmpeg, check_ffprobe};
use vscout_ml_client::HttpAnalysisClient;
use vscout_queue::MessageQueue;
use vscout_worker::{
    init_metrics, init_tracing, FirestoreJobStore, JobStore, MemoryJobStore, PipelineContext, PipelineExecutor,
    StoreBackend, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting vscout-worker");

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        init_metrics(port)?;
        info!(port, "Prometheus metrics listener started");
    }

    check_ffmpeg().context("ffmpeg is required")?;
    check_ffprobe().context("ffprobe is required")?;

    let store: Arc<dyn JobStore> = match config.store_backend {
        StoreBackend::Firestore => {
            let client = FirestoreClient::from_env().await.context("failed to create Firestore client")?;
            Arc::new(FirestoreJobStore::new(client))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory job store; state is lost on restart and not shared between workers");
            Arc::new(MemoryJobStore::new())
        }
    };

    let splitter = Arc::new(config.chunk_splitter());
    let analysis = Arc::new(HttpAnalysisClient::from_env().context("failed to create analysis client")?);
    match analysis.health_check().await {
        Ok(true) => {}
        Ok(false) => warn!("Analysis service reported unhealthy at startup; chunks will retry until it recovers"),
        Err(e) => warn!("Analysis service health check failed at startup: {}; chunks will retry until it recovers", e),
    }
    let queue = Arc::new(MessageQueue::from_env().context("failed to create message queue")?);

    let ctx = PipelineContext::new(config, store, splitter, analysis, queue.clone());
    let executor = Arc::new(PipelineExecutor::new(ctx, queue));

    let shutdown_handle = Arc::clone(&executor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown_handle.shutdown();
        }
    });

    executor.run().await?;

    info!("Worker shutdown complete");
    Ok(())
}
