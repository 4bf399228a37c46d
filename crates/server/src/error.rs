// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use track2stem_core::{SandboxError, ValidationError};

use crate::assemble::AssemblyError;
use crate::media::MediaError;
use crate::pipeline::JobError;
use crate::separation::SeparationError;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Path traversal: {0}")]
    PathTraversal(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Processing timeout")]
    Timeout,

    #[error("Job cancelled")]
    Cancelled,

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upload exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        if err.is_traversal() {
            ApiError::PathTraversal(err.to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::AlreadyActive(id) => ApiError::Conflict(format!("Job {id} is already running")),
            JobError::Sandbox(e) => e.into(),
            JobError::Upload { .. } | JobError::OutputDir { .. } | JobError::Panicked(_) => {
                ApiError::Internal(err.to_string())
            }
            JobError::Cancelled => ApiError::Cancelled,
            JobError::Separation(e) => match e {
                SeparationError::Failed { code, output } => ApiError::ProcessingFailed(
                    if output.is_empty() {
                        format!("separation tool exited with code {code}")
                    } else {
                        output
                    },
                ),
                SeparationError::Spawn(reason) => {
                    tracing::error!(reason = %reason, "separation tool failed to start");
                    ApiError::ProcessingFailed("separation tool could not be started".to_string())
                }
                SeparationError::Timeout(_) => ApiError::Timeout,
                SeparationError::Cancelled => ApiError::Cancelled,
                SeparationError::AlreadyRunning(id) => {
                    ApiError::Conflict(format!("Job {id} is already running"))
                }
                SeparationError::Wait(_) => ApiError::Internal(e.to_string()),
            },
            JobError::Assembly(e) => match e {
                AssemblyError::Sandbox(e) => e.into(),
                AssemblyError::Io { .. } => ApiError::Internal(e.to_string()),
                AssemblyError::OutputMissing(_) | AssemblyError::StemMissing(_) => {
                    ApiError::ProcessingFailed("separation produced no usable output".to_string())
                }
                AssemblyError::Conversion {
                    format,
                    source: MediaError::Spawn { program, reason },
                    ..
                } => {
                    tracing::error!(program = %program, reason = %reason, "media tool failed to start");
                    ApiError::ProcessingFailed(format!(
                        "conversion to {format} failed: media tool could not be started"
                    ))
                }
                AssemblyError::Conversion { format, source, .. } => {
                    ApiError::ProcessingFailed(format!("conversion to {format} failed: {source}"))
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::Validation(err) => {
                tracing::warn!(error = %err, "Validation failed");
                (StatusCode::BAD_REQUEST, ErrorResponse::new(err.to_string()))
            }
            ApiError::PathTraversal(msg) => {
                tracing::warn!(message = %msg, "Rejected path");
                (StatusCode::BAD_REQUEST, ErrorResponse::new("Invalid path"))
            }
            ApiError::JobNotFound(id) => {
                tracing::debug!(job_id = %id, "Job not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::new("Job not found or already completed"),
                )
            }
            ApiError::FileNotFound(name) => {
                tracing::debug!(file = %name, "File not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("File not found", name.clone()),
                )
            }
            ApiError::ProcessingFailed(details) => {
                tracing::error!(details = %details, "Processing failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_details("Processing failed", details.clone()),
                )
            }
            ApiError::Timeout => {
                tracing::error!("Processing timeout");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Processing timeout"),
                )
            }
            ApiError::Cancelled => (StatusCode::CONFLICT, ErrorResponse::new("Job cancelled")),
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
            ApiError::Conflict(msg) => {
                tracing::warn!(message = %msg, "Conflict");
                (
                    StatusCode::CONFLICT,
                    ErrorResponse::with_details("Conflict", msg.clone()),
                )
            }
            ApiError::PayloadTooLarge(limit) => {
                tracing::warn!(limit, "Upload too large");
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    ErrorResponse::new("File too large"),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::path::PathBuf;
    use track2stem_core::OptionField;

    /// Helper to extract status code and body from a response
    async fn extract_response(response: Response) -> (StatusCode, ErrorResponse) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error_response: ErrorResponse = serde_json::from_slice(&body).unwrap();
        (status, error_response)
    }

    #[tokio::test]
    async fn test_validation_returns_400_with_exact_message() {
        let error = ApiError::from(ValidationError::InvalidOption(OptionField::Model));
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "Invalid model");
        assert!(body.details.is_none());
    }

    #[tokio::test]
    async fn test_incompatible_combination_message() {
        let error = ApiError::from(ValidationError::IncompatibleIsolateStem);
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "Incompatible isolate_stem for selected model");
    }

    #[tokio::test]
    async fn test_traversal_hides_paths() {
        let error = ApiError::from(SandboxError::Traversal {
            root: PathBuf::from("/srv/out"),
            attempted: PathBuf::from("/etc/passwd"),
        });
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "Invalid path");
        assert!(body.details.is_none());
    }

    #[tokio::test]
    async fn test_sandbox_root_error_is_internal() {
        let error = ApiError::from(SandboxError::Root {
            root: PathBuf::from("/missing"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        });
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Internal server error");
        assert!(body.details.is_none());
    }

    #[tokio::test]
    async fn test_tool_failure_carries_output() {
        let error = ApiError::from(JobError::Separation(SeparationError::Failed {
            code: 1,
            output: "RuntimeError: boom".into(),
        }));
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Processing failed");
        assert_eq!(body.details.as_deref(), Some("RuntimeError: boom"));
    }

    #[tokio::test]
    async fn test_spawn_failure_hides_binary_path() {
        let error = ApiError::from(JobError::Separation(SeparationError::Spawn(
            "No such file or directory: /opt/secret/bin/demucs".into(),
        )));
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Processing failed");
        let details = body.details.unwrap();
        assert_eq!(details, "separation tool could not be started");
        assert!(!details.contains("/opt/secret"));
    }

    #[tokio::test]
    async fn test_media_spawn_failure_hides_binary_path() {
        let error = ApiError::from(JobError::Assembly(AssemblyError::Conversion {
            path: PathBuf::from("/srv/out/jobs/j/song_t2s_vocals.flac"),
            format: track2stem_core::OutputFormat::Flac,
            source: MediaError::Spawn {
                program: "/opt/secret/bin/ffmpeg".into(),
                reason: "not found".into(),
            },
        }));
        let (_, body) = extract_response(error.into_response()).await;
        assert!(!body.details.unwrap().contains("/opt/secret"));
    }

    #[tokio::test]
    async fn test_timeout_message() {
        let error = ApiError::from(JobError::Separation(SeparationError::Timeout(1800)));
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Processing timeout");
    }

    #[tokio::test]
    async fn test_cancelled_returns_409() {
        let error = ApiError::from(JobError::Cancelled);
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "Job cancelled");
    }

    #[tokio::test]
    async fn test_job_not_found_returns_404() {
        let (status, body) =
            extract_response(ApiError::JobNotFound("abc".into()).into_response()).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "Job not found or already completed");
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let error = ApiError::from(JobError::Upload {
            path: PathBuf::from("/srv/uploads/x"),
            source: std::io::Error::other("disk full"),
        });
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Internal server error");
        assert!(body.details.is_none());
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let (status, body) =
            extract_response(ApiError::PayloadTooLarge(1024).into_response()).await;

        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.error, "File too large");
    }

    #[tokio::test]
    async fn test_already_active_is_conflict() {
        let error = ApiError::from(JobError::AlreadyActive("j1".into()));
        let (status, body) = extract_response(error.into_response()).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.details.unwrap().contains("j1"));
    }
}
