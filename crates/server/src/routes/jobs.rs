// crates/server/src/routes/jobs.rs
//! GET /jobs - every job the service has seen, newest first, with outputs
//! or failure reason once finished.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::jobs::JobRecord;
use crate::state::AppState;

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<JobRecord>> {
    Json(state.statuses.list())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/jobs", get(list_jobs))
}
