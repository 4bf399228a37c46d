// crates/server/src/separation/supervisor.rs
//! Runs one separation under a pseudo-terminal and supervises it to exit,
//! timeout or cancellation.
//!
//! Layout of a run:
//! - a blocking OS thread reads the pty and forwards chunks over a channel
//! - the parser task turns chunks into lines and lines into progress
//! - the estimator task nudges progress forward on a timer
//! - `run` polls the registry for exit against the wall-clock deadline
//!
//! Teardown always cancels the job token first, then joins both tasks with
//! a bounded wait; a task that does not stop in time is detached.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, ExitStatus, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::command::ToolCommand;
use super::progress::{
    estimate_percent, map_tool_percent, parse_progress, strip_ansi, LineSplitter, OutputCapture,
    ESTIMATE_GUARD, PROGRESS_BASE,
};
use crate::config::Config;
use crate::jobs::{ExitPoll, ProcessHandle, ProcessRegistry, StatusStore};

pub const STAGE_SEPARATING: &str = "Separating stems";

#[derive(Debug, Error)]
pub enum SeparationError {
    #[error("could not start separation tool: {0}")]
    Spawn(String),

    #[error("a separation is already running for job {0}")]
    AlreadyRunning(String),

    #[error("separation tool exited with code {code}")]
    Failed { code: u32, output: String },

    #[error("separation timed out after {0}s")]
    Timeout(u64),

    #[error("separation cancelled")]
    Cancelled,

    #[error("lost track of separation process: {0}")]
    Wait(String),
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub timeout: Duration,
    pub estimated_duration: Duration,
    pub estimator_interval: Duration,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
    /// How long the parser keeps reading buffered output after stop.
    pub drain_window: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.separation_timeout(),
            estimated_duration: Duration::from_secs(config.estimated_duration_secs),
            estimator_interval: Duration::from_millis(config.estimator_interval_ms),
            poll_interval: Duration::from_millis(config.exit_poll_interval_ms),
            join_timeout: Duration::from_millis(config.reader_join_timeout_ms),
            drain_window: Duration::from_millis(500),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A finished, successful run.
#[derive(Debug)]
pub struct SeparationRun {
    /// Non-progress output, tail-capped.
    pub output: String,
    pub elapsed: Duration,
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(io::Error),
}

pub struct Supervisor {
    statuses: Arc<StatusStore>,
    processes: Arc<ProcessRegistry>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        statuses: Arc<StatusStore>,
        processes: Arc<ProcessRegistry>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            statuses,
            processes,
            settings,
        }
    }

    pub async fn run(
        &self,
        job_id: &str,
        command: &ToolCommand,
    ) -> Result<SeparationRun, SeparationError> {
        let started = Instant::now();
        let (child, master, reader) =
            spawn_on_pty(command).map_err(|e| SeparationError::Spawn(e.to_string()))?;

        let cancel = CancellationToken::new();
        let handle = ProcessHandle::new(child, master, cancel.clone());
        let pid = handle.pid();
        if let Err(handle) = self.processes.register(job_id, handle) {
            handle.abort();
            return Err(SeparationError::AlreadyRunning(job_id.to_string()));
        }
        tracing::info!(job_id, pid = ?pid, program = %command.program, "separation started");
        self.statuses.advance(job_id, PROGRESS_BASE, STAGE_SEPARATING);

        let (tx, rx) = mpsc::channel(64);
        if let Err(e) = spawn_pty_reader(job_id, reader, tx) {
            if let Some(handle) = self.processes.remove(job_id) {
                handle.terminate(Duration::ZERO).await;
            }
            return Err(SeparationError::Spawn(format!("starting output reader: {e}")));
        }

        let parser = tokio::spawn(read_progress(
            job_id.to_string(),
            rx,
            Arc::clone(&self.statuses),
            cancel.clone(),
            self.settings.drain_window,
        ));
        let estimator = tokio::spawn(estimate_progress(
            job_id.to_string(),
            Arc::clone(&self.statuses),
            cancel.clone(),
            started,
            self.settings.estimated_duration,
            self.settings.estimator_interval,
        ));

        let outcome = self.wait_for_exit(job_id, started).await;
        match &outcome {
            Outcome::Exited(_) => {
                // Dropping the handle closes our pty master.
                drop(self.processes.remove(job_id));
            }
            Outcome::TimedOut | Outcome::WaitFailed(_) => {
                if let Some(handle) = self.processes.remove(job_id) {
                    handle.terminate(Duration::ZERO).await;
                }
            }
            // Whoever cancelled owns teardown of the process.
            Outcome::Cancelled => {}
        }

        cancel.cancel();
        let capture = join_bounded(job_id, "progress parser", parser, self.settings.join_timeout)
            .await
            .unwrap_or_default();
        join_bounded(job_id, "progress estimator", estimator, self.settings.join_timeout).await;

        let elapsed = started.elapsed();
        match outcome {
            Outcome::Exited(status) if status.success() => {
                tracing::info!(job_id, elapsed_ms = elapsed.as_millis() as u64, "separation finished");
                Ok(SeparationRun {
                    output: capture.as_str().to_string(),
                    elapsed,
                })
            }
            Outcome::Exited(status) => {
                let code = status.exit_code();
                tracing::warn!(job_id, code, "separation tool failed");
                Err(SeparationError::Failed {
                    code,
                    output: capture.tail(4096),
                })
            }
            Outcome::TimedOut => {
                tracing::warn!(job_id, timeout_secs = self.settings.timeout.as_secs(), "separation timed out");
                Err(SeparationError::Timeout(self.settings.timeout.as_secs()))
            }
            Outcome::Cancelled => {
                tracing::info!(job_id, "separation cancelled");
                Err(SeparationError::Cancelled)
            }
            Outcome::WaitFailed(e) => {
                tracing::error!(job_id, error = %e, "polling separation tool failed");
                Err(SeparationError::Wait(e.to_string()))
            }
        }
    }

    async fn wait_for_exit(&self, job_id: &str, started: Instant) -> Outcome {
        let deadline = started + self.settings.timeout;
        loop {
            match self.processes.poll_exit(job_id) {
                ExitPoll::Running => {}
                ExitPoll::Exited(status) => return Outcome::Exited(status),
                ExitPoll::Gone => return Outcome::Cancelled,
                ExitPoll::Failed(e) => return Outcome::WaitFailed(e),
            }
            if Instant::now() >= deadline {
                return Outcome::TimedOut;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

type Spawned = (
    Box<dyn Child + Send + Sync>,
    Box<dyn MasterPty + Send>,
    Box<dyn Read + Send>,
);

fn spawn_on_pty(command: &ToolCommand) -> anyhow::Result<Spawned> {
    let pair = native_pty_system().openpty(PtySize {
        rows: 24,
        cols: 200,
        pixel_width: 0,
        pixel_height: 0,
    })?;
    let reader = pair.master.try_clone_reader()?;
    let child = pair.slave.spawn_command(command.to_builder())?;
    // Only the child holds the slave side, so reads end when it exits.
    drop(pair.slave);
    Ok((child, pair.master, reader))
}

fn spawn_pty_reader(
    job_id: &str,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
) -> io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("pty-{job_id}"))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is gone.
                    Err(_) => break,
                }
            }
        })
}

fn handle_line(job_id: &str, statuses: &StatusStore, capture: &mut OutputCapture, raw: &str) {
    let cleaned = strip_ansi(raw);
    let line = cleaned.trim();
    if line.is_empty() {
        return;
    }
    match parse_progress(line) {
        Some(pct) => {
            statuses.advance(job_id, map_tool_percent(pct), STAGE_SEPARATING);
        }
        None => {
            tracing::debug!(job_id, line, "tool output");
            capture.push_line(line);
        }
    }
}

async fn read_progress(
    job_id: String,
    mut rx: mpsc::Receiver<Vec<u8>>,
    statuses: Arc<StatusStore>,
    cancel: CancellationToken,
    drain_window: Duration,
) -> OutputCapture {
    let mut splitter = LineSplitter::default();
    let mut capture = OutputCapture::default();

    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => match chunk {
                Some(bytes) => {
                    for line in splitter.push(&bytes) {
                        handle_line(&job_id, &statuses, &mut capture, &line);
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                let deadline = tokio::time::Instant::now() + drain_window;
                while let Ok(Some(bytes)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                    for line in splitter.push(&bytes) {
                        handle_line(&job_id, &statuses, &mut capture, &line);
                    }
                }
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        handle_line(&job_id, &statuses, &mut capture, &line);
    }
    capture
}

async fn estimate_progress(
    job_id: String,
    statuses: Arc<StatusStore>,
    cancel: CancellationToken,
    started: Instant,
    expected: Duration,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let pct = estimate_percent(started.elapsed(), expected);
                statuses.advance_estimate(&job_id, pct, ESTIMATE_GUARD);
            }
        }
    }
}

async fn join_bounded<T>(
    job_id: &str,
    task: &str,
    handle: JoinHandle<T>,
    limit: Duration,
) -> Option<T> {
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::error!(job_id, task, error = %e, "reader task failed");
            None
        }
        Err(_) => {
            tracing::warn!(job_id, task, "reader did not stop in time, detaching");
            None
        }
    }
}
