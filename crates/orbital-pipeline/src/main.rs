use orbital_core::Config;
use orbital_infra::{init_telemetry, LogFormat};
use orbital_pipeline::setup::{initialize, QueueMode};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;
    init_telemetry("orbital-worker", LogFormat::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let runtime = initialize(config, QueueMode::Worker).await?;

    shutdown_signal().await?;
    runtime.queue().shutdown().await;
    runtime.pool.close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() -> Result<(), anyhow::Error> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                tracing::info!("Received Ctrl+C signal");
            },
            _ = terminate.recv() => {
                tracing::info!("Received terminate signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C signal");
    }

    tracing::info!("Shutting down gracefully...");
    Ok(())
}
