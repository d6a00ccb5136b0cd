//! Background maintenance workers.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod retention_sweeper;
pub mod verification;

pub use retention_sweeper::{RetentionSweeper, SweepReport};
pub use verification::VerificationTask;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn new(name: &'static str, shutdown: CancellationToken, join: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            warn!(worker = self.name, error = %e, "worker ended abnormally");
        }
    }
}
