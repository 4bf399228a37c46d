// crates/server/src/routes/download.rs
//! GET /download/{job_id}/{file} - stream a finished output file.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;
use track2stem_core::{extension, safe_path, sanitize_filename, validate_job_id, ValidationError};

use crate::error::{ApiError, ApiResult};
use crate::layout::JOBS_DIR;
use crate::state::AppState;

fn content_type(filename: &str) -> &'static str {
    match extension(filename).map(str::to_ascii_lowercase).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    Path((job_id, file)): Path<(String, String)>,
) -> ApiResult<Response> {
    if !validate_job_id(&job_id) {
        return Err(ValidationError::InvalidJobId.into());
    }
    // Only names the assembler could have produced.
    if sanitize_filename(&file).as_deref() != Some(file.as_str()) {
        tracing::warn!(job_id = %job_id, file = %file, "Rejected download name");
        return Err(ApiError::PathTraversal(file));
    }
    let path = safe_path(
        &state.config.output_dir,
        [JOBS_DIR, job_id.as_str(), file.as_str()],
    )?;

    let handle = match tokio::fs::File::open(&path).await {
        Ok(handle) => handle,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ApiError::FileNotFound(file));
        }
        Err(e) => return Err(ApiError::Internal(format!("{}: {e}", path.display()))),
    };
    let metadata = handle
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(format!("{}: {e}", path.display())))?;
    if !metadata.is_file() {
        return Err(ApiError::FileNotFound(file));
    }

    tracing::info!(job_id = %job_id, file = %file, bytes = metadata.len(), "serving download");
    let body = Body::from_stream(ReaderStream::new(handle));
    Ok((
        [
            (header::CONTENT_TYPE, content_type(&file).to_string()),
            (header::CONTENT_LENGTH, metadata.len().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file}\""),
            ),
        ],
        body,
    )
        .into_response())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/download/{job_id}/{file}", get(download))
}
