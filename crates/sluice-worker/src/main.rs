use anyhow::{Context, Result};
use sluice_worker::{init_telemetry, IngestWorker, TelemetryConfig, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before reading any configuration
    let dotenv_path = dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - SLUICE_*: Pipeline sizing and load shape (see WorkerConfig)
    init_telemetry(&TelemetryConfig::from_env())?;

    if let Some(path) = dotenv_path {
        tracing::info!(path = %path.display(), "Loaded environment file");
    }

    let config = WorkerConfig::from_env();
    tracing::info!(
        worker_id = %config.worker_id,
        tasks = config.load.tasks,
        shutdown_timeout_ms = config.shutdown_timeout.as_millis() as u64,
        "sluice-worker starting..."
    );

    let worker = IngestWorker::new(config).context("Failed to build ingest pipeline")?;

    // Run the load until it finishes or we are interrupted
    tokio::select! {
        report = worker.run_load() => {
            tracing::info!(
                accepted = report.accepted,
                rejected = report.rejected,
                failed = report.failed,
                "Load complete"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    let drained = worker.shutdown().await;
    worker.log_summary();

    drained.context("Pipeline did not drain before the shutdown deadline")?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}
