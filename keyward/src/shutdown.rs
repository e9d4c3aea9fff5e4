//! Graceful shutdown.
//!
//! A signal cancels the replica token; every loop and hint task observes it.
//! The drain then waits for tracked hint tasks to release their leases.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default drain timeout (25s to leave 5s buffer for K8s SIGKILL at 30s)
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(25);

/// Install SIGTERM/SIGINT handlers. The returned future resolves after the
/// first signal, once `cancel` has been cancelled.
#[cfg(unix)]
pub fn install_signal_handlers(
    cancel: CancellationToken,
) -> std::io::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "keyward::shutdown", "SIGTERM received, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!(target: "keyward::shutdown", "SIGINT received, initiating graceful shutdown");
            }
        }
        cancel.cancel();
    })
}

#[cfg(windows)]
pub fn install_signal_handlers(
    cancel: CancellationToken,
) -> std::io::Result<impl std::future::Future<Output = ()>> {
    Ok(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(target: "keyward::shutdown", error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!(target: "keyward::shutdown", "Ctrl+C received, initiating graceful shutdown");
        cancel.cancel();
    })
}

/// Close `tracker` and wait for its tasks. Returns false on timeout.
pub async fn drain_with_timeout(tracker: &TaskTracker, timeout: Duration) -> bool {
    tracker.close();
    info!(
        target: "keyward::shutdown",
        timeout_secs = timeout.as_secs(),
        in_flight = tracker.len(),
        "Beginning drain sequence"
    );

    let start = tokio::time::Instant::now();
    if tokio::time::timeout(timeout, tracker.wait()).await.is_err() {
        warn!(
            target: "keyward::shutdown",
            in_flight = tracker.len(),
            "Drain timeout exceeded, forcing shutdown"
        );
        return false;
    }

    info!(
        target: "keyward::shutdown",
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Drain sequence complete"
    );
    true
}
