use anyhow::{Context, Result};
use tenantflow_worker::{init_telemetry, TelemetryConfig, WorkerConfig, WorkerRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info" for tenantflow crates)
    init_telemetry(&TelemetryConfig::from_env());

    tracing::info!("tenantflow-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    tracing::info!(
        worker_id = %config.worker_id,
        max_concurrent = config.max_concurrent_tasks,
        run_migrations = config.run_migrations,
        "Starting worker"
    );

    let runtime = WorkerRuntime::connect(config)
        .await
        .context("Failed to create worker")?;

    // Run until Ctrl-C, then drain
    runtime
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal");
        })
        .await?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
