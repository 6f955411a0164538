//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for the process termination signals
//! - Hand exactly one shutdown trigger to the lifecycle controller
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - On Unix SIGINT, SIGTERM and SIGQUIT all mean "shut down gracefully";
//!   Ctrl-C is awaited as well
//! - Elsewhere only Ctrl-C is available

/// Resolve when the process is asked to terminate.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigquit.recv() => tracing::info!("Received SIGQUIT"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}
