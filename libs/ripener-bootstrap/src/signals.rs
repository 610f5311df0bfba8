use anyhow::Result;
use tokio::signal;

/// Wait for termination signals (Ctrl+C, SIGTERM) and log which one arrived.
pub async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .inspect_err(|e| tracing::error!(%e, "Failed to install SIGTERM handler"))?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.inspect_err(|e| tracing::error!(%e, "Error handling Ctrl+C signal"))?;
                tracing::info!("Received Ctrl+C signal");
            }
            _ = terminate.recv() => tracing::info!("Received SIGTERM signal"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .inspect_err(|e| tracing::error!(%e, "Failed to install Ctrl+C handler"))?;
        tracing::info!("Received Ctrl+C signal");
    }

    tracing::info!("Shutdown signal received, initiating graceful shutdown");
    Ok(())
}

/// Infallible variant for shutdown futures: if no handler can be installed
/// the future never completes and the process is stopped externally.
pub async fn shutdown_signal() {
    if let Err(e) = wait_for_shutdown().await {
        tracing::warn!(error = %e, "No shutdown signal handler; waiting indefinitely");
        std::future::pending::<()>().await;
    }
}
