// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::jobs::{JobStatus, ProcessRegistry, StatusStore};

/// Shared application state accessible from all route handlers.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub config: Arc<Config>,
    /// Per-job status snapshots (and their broadcast for SSE).
    pub statuses: Arc<StatusStore>,
    /// Live separation processes. An entry exists exactly while a job's
    /// tool is running and nobody has claimed it for cancel or timeout.
    pub processes: Arc<ProcessRegistry>,
}

impl AppState {
    /// Create a new application state wrapped in an Arc for sharing.
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            config: Arc::new(config),
            statuses: Arc::new(StatusStore::new()),
            processes: Arc::new(ProcessRegistry::new()),
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Terminate every live process, e.g. on shutdown.
    pub async fn shutdown_processes(&self) {
        let grace = self.config.cancel_grace();
        for (job_id, handle) in self.processes.drain() {
            tracing::info!(job_id = %job_id, pid = ?handle.pid(), "terminating on shutdown");
            self.statuses
                .set(&job_id, JobStatus::Cancelled, 0, "Server shutting down");
            handle.terminate(grace).await;
        }
    }
}
