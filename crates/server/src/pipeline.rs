// crates/server/src/pipeline.rs
//! One job end to end: store the upload, run the separation, assemble the
//! results, clean up, and record the outcome.
//!
//! Progress stages:
//!
//! | progress | stage                              |
//! |----------|------------------------------------|
//! | 0        | uploading                          |
//! | 5        | starting separation                |
//! | 10-90    | separation (tool output, estimate) |
//! | 92       | organizing / converting / mixing   |
//! | 95       | cleaning up                        |
//! | 100      | completed                          |

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use serde::Serialize;
use thiserror::Error;
use track2stem_core::{format_elapsed, OutputFormat, SandboxError, SeparationOptions};

use crate::assemble::{AssembledOutput, Assembler, AssemblyError, ASSEMBLY_PROGRESS};
use crate::cleanup::{cleanup_job, Outputs};
use crate::jobs::{JobOutcome, JobStatus};
use crate::layout::{job_output_dir, JobLayout};
use crate::media::MediaTools;
use crate::separation::{separation_command, SeparationError, Supervisor, SupervisorSettings};
use crate::state::AppState;

pub const STAGE_UPLOADING: &str = "Uploading file";
pub const STAGE_STARTING: &str = "Starting separation";
pub const STAGE_ORGANIZING: &str = "Organizing output files";
pub const STAGE_CLEANUP: &str = "Cleaning up";
pub const STAGE_COMPLETED: &str = "Completed";
pub const STAGE_CANCELLED: &str = "Cancelled by user";

/// A validated job submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: String,
    /// Sanitized client file name.
    pub filename: String,
    pub options: SeparationOptions,
    pub data: Bytes,
}

/// Body of a successful `POST /process`.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct JobResult {
    pub status: JobStatus,
    pub job_id: String,
    /// Track name to file name inside the job's output directory.
    pub outputs: BTreeMap<String, String>,
    pub output_format: OutputFormat,
    pub processing_time: String,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} is already active")]
    AlreadyActive(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("writing upload {path}: {source}")]
    Upload {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("clearing output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Separation(#[from] SeparationError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error("job cancelled")]
    Cancelled,

    #[error("job task failed: {0}")]
    Panicked(String),
}

impl JobError {
    /// Stage text recorded with a `failed` status. Never carries paths.
    pub fn status_stage(&self) -> String {
        match self {
            Self::Separation(SeparationError::Timeout(_)) => "Processing timeout".to_string(),
            Self::Separation(SeparationError::Failed { code, .. }) => {
                format!("Failed: separation exited with code {code}")
            }
            Self::Separation(SeparationError::Spawn(_)) => {
                "Failed: separation tool could not be started".to_string()
            }
            Self::Assembly(AssemblyError::Conversion { format, .. }) => {
                format!("Failed: conversion to {format} failed")
            }
            Self::Assembly(AssemblyError::OutputMissing(_) | AssemblyError::StemMissing(_)) => {
                "Failed: separation produced no usable output".to_string()
            }
            _ => "Failed: internal error".to_string(),
        }
    }

    /// Failure reason kept on the job record.
    pub fn status_error(&self) -> String {
        let stage = self.status_stage();
        stage
            .strip_prefix("Failed: ")
            .map(str::to_string)
            .unwrap_or(stage)
    }
}

/// Run a submission on its own task so a dropped client connection does
/// not abandon the process, and a panic still ends in a `failed` status.
pub async fn submit(state: Arc<AppState>, submission: Submission) -> Result<JobResult, JobError> {
    let job_id = submission.job_id.clone();
    let task = tokio::spawn(run_job(Arc::clone(&state), submission));
    match task.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "job task panicked");
            if let Some(handle) = state.processes.remove(&job_id) {
                handle.terminate(state.config.cancel_grace()).await;
            }
            let err = JobError::Panicked(e.to_string());
            record_failure(&state, &job_id, &err);
            Err(err)
        }
    }
}

pub async fn run_job(state: Arc<AppState>, submission: Submission) -> Result<JobResult, JobError> {
    let job_id = submission.job_id.as_str();
    if !state
        .statuses
        .try_begin(job_id, &submission.filename, STAGE_UPLOADING)
    {
        tracing::warn!(job_id, "duplicate submission for active job");
        return Err(JobError::AlreadyActive(job_id.to_string()));
    }
    let started = Instant::now();
    tracing::info!(
        job_id,
        filename = %submission.filename,
        model = %submission.options.model,
        format = %submission.options.output_format,
        mode = %submission.options.stem_mode,
        bytes = submission.data.len(),
        "job admitted"
    );

    let layout = match JobLayout::new(
        &state.config.upload_dir,
        &state.config.output_dir,
        job_id,
        &submission.filename,
        submission.options.model,
    ) {
        Ok(layout) => layout,
        Err(e) => {
            let err = JobError::from(e);
            record_failure(&state, job_id, &err);
            return Err(err);
        }
    };

    // A resubmitted id replaces whatever an earlier run left behind.
    if let Err(source) = clear_dir(&layout.job_output).await {
        let err = JobError::OutputDir {
            path: layout.job_output.clone(),
            source,
        };
        record_failure(&state, job_id, &err);
        return Err(err);
    }

    match execute(&state, &layout, &submission).await {
        Ok(output) => {
            state
                .statuses
                .update_processing(job_id, 95, STAGE_CLEANUP);
            cleanup_job(
                &layout,
                Some(&output.source_dir),
                &state.processes,
                Outputs::Keep,
            );
            if !state.statuses.finish_with(
                job_id,
                JobStatus::Completed,
                100,
                STAGE_COMPLETED,
                JobOutcome::outputs(output.file_names()),
            ) {
                tracing::info!(job_id, "job cancelled after separation finished");
                cleanup_job(&layout, None, &state.processes, Outputs::Remove);
                return Err(JobError::Cancelled);
            }
            let processing_time = format_elapsed(started.elapsed());
            tracing::info!(job_id, outputs = output.files.len(), processing_time = %processing_time, "job completed");
            Ok(JobResult {
                status: JobStatus::Completed,
                job_id: job_id.to_string(),
                outputs: output.file_names(),
                output_format: submission.options.output_format,
                processing_time,
            })
        }
        Err(JobError::Separation(SeparationError::Cancelled)) => {
            cleanup_job(&layout, None, &state.processes, Outputs::Remove);
            // No-op when the canceller already recorded it.
            state
                .statuses
                .finish(job_id, JobStatus::Cancelled, 0, STAGE_CANCELLED);
            Err(JobError::Cancelled)
        }
        Err(err) => {
            tracing::warn!(job_id, error = %err, "job failed");
            cleanup_job(&layout, None, &state.processes, Outputs::Remove);
            record_failure(&state, job_id, &err);
            Err(err)
        }
    }
}

fn record_failure(state: &AppState, job_id: &str, err: &JobError) {
    state.statuses.finish_with(
        job_id,
        JobStatus::Failed,
        0,
        &err.status_stage(),
        JobOutcome::error(err.status_error()),
    );
}

async fn clear_dir(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn execute(
    state: &AppState,
    layout: &JobLayout,
    submission: &Submission,
) -> Result<AssembledOutput, JobError> {
    let job_id = layout.job_id.as_str();
    tokio::fs::write(&layout.input, &submission.data)
        .await
        .map_err(|source| JobError::Upload {
            path: layout.input.clone(),
            source,
        })?;
    state.statuses.update_processing(job_id, 5, STAGE_STARTING);

    let command = separation_command(
        &state.config.demucs_bin,
        &submission.options,
        &layout.output_root,
        &layout.input,
    );
    let supervisor = Supervisor::new(
        Arc::clone(&state.statuses),
        Arc::clone(&state.processes),
        SupervisorSettings::from_config(&state.config),
    );
    supervisor.run(job_id, &command).await?;

    state
        .statuses
        .update_processing(job_id, ASSEMBLY_PROGRESS, STAGE_ORGANIZING);
    let media = MediaTools::new(&state.config.ffmpeg_bin, state.config.media_tool_timeout());
    let output = Assembler::new(&media, &state.statuses)
        .assemble(layout, &submission.options)
        .await?;
    Ok(output)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// No live process for the id: unknown, finished, or already cancelled.
    NotFound,
}

/// Stop a running job. Taking the registry entry decides the race with the
/// job's own completion: if the entry is already gone there is nothing to
/// cancel.
///
/// The status is recorded before the process is signalled, and termination
/// runs on its own task, so dropping this future mid-grace still ends with a
/// `cancelled` job and a dead process.
pub async fn cancel_job(state: &AppState, job_id: &str) -> Result<CancelOutcome, SandboxError> {
    let job_output = job_output_dir(&state.config.output_dir, job_id)?;
    let Some(handle) = state.processes.remove(job_id) else {
        return Ok(CancelOutcome::NotFound);
    };
    tracing::info!(job_id, pid = ?handle.pid(), runtime_ms = handle.runtime().as_millis() as u64, "cancelling job");
    state
        .statuses
        .set(job_id, JobStatus::Cancelled, 0, STAGE_CANCELLED);

    let grace = state.config.cancel_grace();
    let owned_id = job_id.to_string();
    let termination = tokio::spawn(async move {
        handle.terminate(grace).await;
        if let Err(e) = clear_dir(&job_output).await {
            tracing::warn!(job_id = %owned_id, path = %job_output.display(), error = %e, "removing cancelled job output");
        }
    });
    if let Err(e) = termination.await {
        tracing::error!(job_id, error = %e, "cancel termination task failed");
    }
    Ok(CancelOutcome::Cancelled)
}
