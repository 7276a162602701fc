// Unix signal handling for graceful shutdown
// Captures SIGTERM and SIGINT and fans them out as cancellation to every instance

use anyhow::Result;
use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

/// Create a future that resolves when a shutdown signal is received
/// Listens for SIGTERM and SIGINT (Ctrl+C)
pub fn create_shutdown_listener() -> Result<impl std::future::Future<Output = ()>> {
    let signals = Signals::new([SIGTERM, SIGINT])?;

    Ok(async move {
        let mut signals = signals;

        while let Some(signal) = signals.next().await {
            match signal {
                SIGTERM => {
                    info!("Received SIGTERM - graceful shutdown initiated");
                    break;
                }
                SIGINT => {
                    info!("Received SIGINT (Ctrl+C) - graceful shutdown initiated");
                    break;
                }
                _ => {
                    debug!("Received unexpected signal: {}", signal);
                }
            }
        }
    })
}

/// Root of the cancellation tree
///
/// Each instance runs on a child token, so one instance can be stopped alone
/// while triggering the root stops them all.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for one instance's task group
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger shutdown across all subsystems
    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            self.token.cancel();
            info!("Shutdown signal broadcast to all instances");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
