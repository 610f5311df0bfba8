//! Async runner: boot, wait for a shutdown trigger, stop.
//!
//! Module activators are synchronous, so boot and stop run on the blocking
//! pool. Shutdown can be driven by OS signals, an external
//! `CancellationToken`, or an arbitrary future.

use std::{future::Future, pin::Pin};

use tokio_util::sync::CancellationToken;

use super::host_runtime::{RunOptions, Runtime};
use super::shutdown;

/// How the runner should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

/// Full cycle: start → wait → stop.
pub async fn run(opts: RunOptions, shutdown: ShutdownOptions) -> anyhow::Result<()> {
    let cancel = match &shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };

    match shutdown {
        ShutdownOptions::Signals => {
            let c = cancel.clone();
            tokio::spawn(async move {
                match shutdown::wait_for_shutdown().await {
                    Ok(()) => tracing::info!("shutdown: signal received"),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "shutdown: signal waiter failed; falling back to ctrl_c()"
                        );
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
                c.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    let runtime = tokio::task::spawn_blocking(move || Runtime::start(opts)).await??;

    cancel.cancelled().await;

    tokio::task::spawn_blocking(move || runtime.stop()).await?;
    tracing::info!("Runtime stopped");
    Ok(())
}
