// crates/server/src/routes/cancel.rs
//! POST /cancel/{job_id} - stop a running job.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use track2stem_core::{validate_job_id, ValidationError};

use crate::error::{ApiError, ApiResult};
use crate::jobs::JobStatus;
use crate::pipeline::{cancel_job, CancelOutcome};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct CancelResponse {
    pub status: JobStatus,
    pub job_id: String,
}

/// Cancelling a job that already finished, or was cancelled before, is a 404.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    if !validate_job_id(&job_id) {
        return Err(ValidationError::InvalidJobId.into());
    }
    match cancel_job(&state, &job_id).await? {
        CancelOutcome::Cancelled => Ok(Json(CancelResponse {
            status: JobStatus::Cancelled,
            job_id,
        })),
        CancelOutcome::NotFound => Err(ApiError::JobNotFound(job_id)),
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/cancel/{job_id}", post(cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn post_cancel(state: Arc<AppState>, job_id: &str) -> StatusCode {
        router()
            .with_state(state)
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/cancel/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::new(Config {
            upload_dir: tmp.path().to_path_buf(),
            output_dir: tmp.path().to_path_buf(),
            ..Config::default()
        });
        assert_eq!(post_cancel(state, "ghost").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_invalid_id_is_400() {
        let state = AppState::new(Config::default());
        assert_eq!(post_cancel(state, "bad_id").await, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_404_and_keeps_status() {
        let tmp = tempfile::tempdir().unwrap();
        let state = AppState::new(Config {
            upload_dir: tmp.path().to_path_buf(),
            output_dir: tmp.path().to_path_buf(),
            ..Config::default()
        });
        state.statuses.try_begin("fin", "song.wav", "Uploading file");
        state
            .statuses
            .finish("fin", JobStatus::Completed, 100, "Completed");

        assert_eq!(
            post_cancel(Arc::clone(&state), "fin").await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(state.statuses.status("fin"), JobStatus::Completed);
    }
}
