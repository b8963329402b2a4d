//! Process shutdown signals.

use std::future::Future;
use std::io;

use tokio_util::sync::CancellationToken;

/// Wait for Ctrl+C or SIGTERM. Returns the name of the signal.
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "Ctrl+C")
}

/// Cancel `token` once `signal` fires. A listener that fails to install
/// leaves the token alone.
pub async fn cancel_on<F>(signal: F, token: CancellationToken)
where
    F: Future<Output = io::Result<&'static str>>,
{
    match signal.await {
        Ok(name) => {
            tracing::info!(signal = name, "Received shutdown signal, stopping gracefully...");
            token.cancel();
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for shutdown signals");
        }
    }
}
