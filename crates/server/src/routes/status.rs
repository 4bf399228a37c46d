// crates/server/src/routes/status.rs
//! Job status polling and streaming.
//!
//! - GET /status/{job_id}        latest snapshot, or the `unknown` sentinel
//! - GET /status/{job_id}/stream SSE of snapshots until a terminal status

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::broadcast::error::RecvError;
use track2stem_core::{validate_job_id, ValidationError};

use crate::error::ApiResult;
use crate::jobs::JobSnapshot;
use crate::state::AppState;

fn checked_job_id(job_id: &str) -> Result<(), ValidationError> {
    if validate_job_id(job_id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidJobId)
    }
}

fn snapshot_event(snapshot: &JobSnapshot) -> Event {
    let json = serde_json::to_string(snapshot).unwrap_or_default();
    Event::default().event("status").data(json)
}

/// GET /status/{job_id}
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    checked_job_id(&job_id)?;
    Ok(Json(state.statuses.get(&job_id)))
}

/// GET /status/{job_id}/stream
pub async fn stream_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    checked_job_id(&job_id)?;
    // Subscribe before reading the current snapshot so nothing falls between.
    let mut rx = state.statuses.subscribe();
    let initial = state.statuses.get(&job_id);

    let stream = async_stream::stream! {
        let done = initial.status.is_terminal();
        yield Ok(snapshot_event(&initial));
        if done {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(update) if update.job_id == job_id => {
                    let done = update.snapshot.status.is_terminal();
                    yield Ok(snapshot_event(&update.snapshot));
                    if done {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %job_id, skipped, "status stream lagged");
                    let current = state.statuses.get(&job_id);
                    let done = current.status.is_terminal();
                    yield Ok(snapshot_event(&current));
                    if done {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status/{job_id}", get(get_status))
        .route("/status/{job_id}/stream", get(stream_status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::JobStatus;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, String) {
        let response = router()
            .with_state(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_unknown_job_returns_sentinel() {
        let state = AppState::new(Config::default());
        let (status, body) = get(state, "/status/never-seen").await;

        assert_eq!(status, StatusCode::OK);
        let snapshot: JobSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(snapshot.status, JobStatus::Unknown);
        assert_eq!(snapshot.progress, 0);
    }

    #[tokio::test]
    async fn test_invalid_job_id_rejected() {
        let state = AppState::new(Config::default());
        let (status, body) = get(state, "/status/-leading").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Invalid job ID"));
    }

    #[tokio::test]
    async fn test_returns_latest_snapshot() {
        let state = AppState::new(Config::default());
        state.statuses.try_begin("job-1", "song.wav", "Uploading file");
        state.statuses.update_processing("job-1", 42, "Separating stems");

        let (status, body) = get(state, "/status/job-1").await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: JobSnapshot = serde_json::from_str(&body).unwrap();
        assert_eq!(snapshot.status, JobStatus::Processing);
        assert_eq!(snapshot.progress, 42);
        assert_eq!(snapshot.stage, "Separating stems");
    }

    #[tokio::test]
    async fn test_stream_of_finished_job_ends_after_one_event() {
        let state = AppState::new(Config::default());
        state.statuses.try_begin("done", "song.wav", "Uploading file");
        state
            .statuses
            .finish("done", JobStatus::Completed, 100, "Completed");

        let (status, body) = get(state, "/status/done/stream").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.matches("event: status").count(), 1);
        assert!(body.contains("\"status\":\"completed\""));
    }

    #[tokio::test]
    async fn test_stream_follows_job_to_terminal_status() {
        let state = AppState::new(Config::default());
        state.statuses.try_begin("live", "song.wav", "Uploading file");

        let writer = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            writer.statuses.set("other", JobStatus::Processing, 5, "noise");
            writer.statuses.update_processing("live", 30, "Separating stems");
            writer
                .statuses
                .finish("live", JobStatus::Failed, 0, "Processing timeout");
        });

        let (status, body) = get(state, "/status/live/stream").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.contains("noise"));
        assert!(body.contains("\"progress\":30"));
        assert!(body.contains("\"status\":\"failed\""));
    }
}
