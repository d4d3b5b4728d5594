//! Stop handle shared by the background loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

/// Handle to a spawned interval loop.
pub struct DaemonHandle {
    stop_flag: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl DaemonHandle {
    pub(crate) fn new(stop_flag: Arc<AtomicBool>, join: JoinHandle<()>) -> Self {
        Self { stop_flag, join }
    }

    /// Request the loop to stop after its current tick.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Stop and wait for the loop task to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "background loop ended abnormally");
        }
    }
}
