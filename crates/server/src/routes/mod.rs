// crates/server/src/routes/mod.rs
//! HTTP route handlers for the track2stem server.

pub mod cancel;
pub mod download;
pub mod health;
pub mod jobs;
pub mod process;
pub mod status;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;

use crate::state::AppState;

/// Create the combined router. Routes sit at the root to match the paths
/// the web gateway already proxies.
///
/// Routes:
/// - GET  /health                   - Health check
/// - POST /process                  - Upload and separate (blocks until done)
/// - GET  /jobs                     - Every known job, newest first
/// - GET  /status/{job_id}          - Latest job snapshot
/// - GET  /status/{job_id}/stream   - SSE of job snapshots
/// - POST /cancel/{job_id}          - Cancel a running job
/// - GET  /download/{job_id}/{file} - Fetch an output file
pub fn api_routes(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_bytes();
    Router::new()
        .merge(health::router())
        .merge(process::router().layer(DefaultBodyLimit::max(upload_limit)))
        .merge(jobs::router())
        .merge(status::router())
        .merge(cancel::router())
        .merge(download::router())
        .with_state(state)
}
