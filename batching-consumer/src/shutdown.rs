//! Shutdown Coordinator - Turns SIGINT/SIGTERM into a cooperative stop request
//!
//! The consumer loop checks the flag between batches, so a batch already
//! dispatched is always finished and committed before the process exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns false when a stop was already requested.
    pub fn trigger(&self, source: &str) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            info!(source, "Shutdown already in progress");
            return false;
        }
        info!(source, "Shutdown requested, draining in-flight work");
        self.token.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trap SIGINT and SIGTERM for the lifetime of the process.
    ///
    /// Every signal is forwarded to [`ShutdownCoordinator::trigger`], so
    /// repeated signals do nothing beyond a log line.
    pub fn install_signal_handlers(&self) -> std::io::Result<JoinHandle<()>> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let coordinator = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = sigint.recv() => {
                        coordinator.trigger("SIGINT");
                    }
                    Some(()) = sigterm.recv() => {
                        coordinator.trigger("SIGTERM");
                    }
                    else => break,
                }
            }
        }))
    }
}
