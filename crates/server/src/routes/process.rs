// crates/server/src/routes/process.rs
//! POST /process - accept an upload and run it to completion.
//!
//! Multipart fields: `file` (required), `job_id` (optional, generated when
//! absent) and the separation options by name. The request stays open until
//! the job reaches a terminal status.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use track2stem_core::{
    allowed_file, sanitize_filename, validate_job_id, RawOptions, SeparationOptions,
    ValidationError,
};

use crate::error::{ApiError, ApiResult};
use crate::pipeline::{self, JobResult, Submission};
use crate::state::AppState;

/// Everything the form carried, before validation.
#[derive(Debug, Default)]
struct ProcessForm {
    job_id: Option<String>,
    file: Option<(String, Bytes)>,
    options: RawOptions,
}

async fn read_form(mut multipart: Multipart, limit: usize) -> ApiResult<ProcessForm> {
    let mut form = ProcessForm::default();
    let multipart_error = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(limit)
        } else {
            ApiError::BadRequest(e.body_text())
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(multipart_error)?;
                form.file = Some((filename, data));
            }
            "job_id" => {
                form.job_id = Some(field.text().await.map_err(multipart_error)?);
            }
            other => {
                let value = field.text().await.map_err(multipart_error)?;
                if !form.options.set(other, value) {
                    tracing::debug!(field = other, "ignoring unknown form field");
                }
            }
        }
    }
    Ok(form)
}

/// Validate the form in client-visible order. Nothing here touches disk.
fn admit(form: ProcessForm) -> Result<Submission, ValidationError> {
    let job_id = match form.job_id.filter(|id| !id.is_empty()) {
        Some(id) if validate_job_id(&id) => id,
        Some(_) => return Err(ValidationError::InvalidJobId),
        None => uuid::Uuid::new_v4().to_string(),
    };
    let (raw_name, data) = form.file.ok_or(ValidationError::MissingFile)?;
    if raw_name.is_empty() {
        return Err(ValidationError::EmptyFilename);
    }
    let filename = sanitize_filename(&raw_name).ok_or(ValidationError::FileTypeNotAllowed)?;
    if !allowed_file(&filename) {
        return Err(ValidationError::FileTypeNotAllowed);
    }
    let options = SeparationOptions::from_raw(&form.options)?;

    Ok(Submission {
        job_id,
        filename,
        options,
        data,
    })
}

/// POST /process
pub async fn process(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<Json<JobResult>> {
    let form = read_form(multipart, state.config.max_upload_bytes()).await?;
    let submission = admit(form)?;
    tracing::info!(job_id = %submission.job_id, "processing request accepted");

    let result = pipeline::submit(state, submission).await?;
    Ok(Json(result))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/process", post(process))
}
