// crates/server/src/jobs/status.rs
//! Per-job status table shared by the pipeline, the progress readers and
//! the HTTP status endpoints.
//!
//! Every write goes through one `RwLock` write guard, so a progress update
//! and a terminal transition can never interleave halfway. Updates are also
//! broadcast for the SSE status stream.
//!
//! A record keeps what a poller needs after the job ends: the output file
//! names on success, the failure reason otherwise, and its timestamps.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use track2stem_core::format_elapsed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
    Cancelled,
    /// Reported for ids the service has never seen.
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Uploading or processing.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Uploading | Self::Processing)
    }
}

/// What `GET /status/{job_id}` returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub progress: u8,
    pub stage: String,
    /// Time since the job was admitted, e.g. `"1m 05s"`. Frozen once the
    /// job reaches a terminal status.
    pub elapsed: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Track name to file name, set when the job completes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<String>,
}

impl JobSnapshot {
    pub fn unknown() -> Self {
        Self {
            status: JobStatus::Unknown,
            progress: 0,
            stage: "Checking status...".to_string(),
            elapsed: "0s".to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            filename: None,
            outputs: BTreeMap::new(),
            error: None,
            created_at: None,
            completed_at: None,
            processing_time: None,
        }
    }
}

/// One row of `GET /jobs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct JobRecord {
    pub job_id: String,
    #[serde(flatten)]
    pub snapshot: JobSnapshot,
}

/// What a terminal write leaves on the record besides status and stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn outputs(outputs: BTreeMap<String, String>) -> Self {
        Self {
            outputs,
            error: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            outputs: BTreeMap::new(),
            error: Some(error.into()),
        }
    }
}

/// Broadcast payload for status subscribers.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub job_id: String,
    pub snapshot: JobSnapshot,
}

struct Entry {
    status: JobStatus,
    progress: u8,
    stage: String,
    started: Instant,
    finished: Option<Instant>,
    filename: Option<String>,
    outputs: BTreeMap<String, String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn new(status: JobStatus, progress: u8, stage: &str) -> Self {
        let now = Utc::now();
        Self {
            status,
            progress: progress.min(100),
            stage: stage.to_string(),
            started: Instant::now(),
            finished: None,
            filename: None,
            outputs: BTreeMap::new(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        let elapsed = format_elapsed(
            self.finished
                .map_or_else(|| self.started.elapsed(), |end| end - self.started),
        );
        JobSnapshot {
            status: self.status,
            progress: self.progress,
            stage: self.stage.clone(),
            processing_time: self.finished.map(|_| elapsed.clone()),
            elapsed,
            updated_at: self.updated_at.to_rfc3339(),
            filename: self.filename.clone(),
            outputs: self.outputs.clone(),
            error: self.error.clone(),
            created_at: Some(self.created_at.to_rfc3339()),
            completed_at: self.completed_at.map(|at| at.to_rfc3339()),
        }
    }

    /// Apply a write, keeping progress monotonic while the job stays in
    /// `processing`.
    fn apply(&mut self, status: JobStatus, progress: u8, stage: &str) {
        let progress = progress.min(100);
        self.progress = if self.status == JobStatus::Processing && status == JobStatus::Processing
        {
            self.progress.max(progress)
        } else {
            progress
        };
        let now = Utc::now();
        if !status.is_terminal() {
            self.finished = None;
            self.completed_at = None;
        } else if !self.status.is_terminal() {
            self.finished = Some(Instant::now());
            self.completed_at = Some(now);
        }
        self.status = status;
        self.stage = stage.to_string();
        self.updated_at = now;
    }
}

/// Status table keyed by job id.
///
/// Entries are never evicted; one entry is a few hundred bytes and the
/// service is expected to be restarted long before that matters.
pub struct StatusStore {
    entries: RwLock<HashMap<String, Entry>>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl StatusStore {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            entries: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Admit a job: create (or reset) its entry unless it is already active.
    ///
    /// Returns `false` when another submission with the same id is still
    /// uploading or processing.
    pub fn try_begin(&self, job_id: &str, filename: &str, stage: &str) -> bool {
        match self.entries.write() {
            Ok(mut entries) => {
                if entries.get(job_id).is_some_and(|e| e.status.is_active()) {
                    return false;
                }
                let mut entry = Entry::new(JobStatus::Uploading, 0, stage);
                entry.filename = Some(filename.to_string());
                self.publish(job_id, &entry);
                entries.insert(job_id.to_string(), entry);
                true
            }
            Err(e) => {
                tracing::error!("RwLock poisoned writing job statuses: {e}");
                false
            }
        }
    }

    /// Overwrite a job's status. Creates the entry if needed.
    pub fn set(&self, job_id: &str, status: JobStatus, progress: u8, stage: &str) {
        self.write(job_id, |entry| {
            entry.apply(status, progress, stage);
            true
        });
    }

    /// Pipeline stage change. Ignored once the job has reached a terminal
    /// status, so a late stage write cannot resurrect a cancelled job.
    pub fn update_processing(&self, job_id: &str, progress: u8, stage: &str) -> bool {
        self.write(job_id, |entry| {
            if !entry.status.is_active() {
                return false;
            }
            entry.apply(JobStatus::Processing, progress, stage);
            true
        })
    }

    /// Raise progress from the tool's own output. Only applies while the job
    /// is processing and only if it moves forward.
    pub fn advance(&self, job_id: &str, progress: u8, stage: &str) -> bool {
        self.write(job_id, |entry| {
            if entry.status != JobStatus::Processing || progress <= entry.progress {
                return false;
            }
            entry.apply(JobStatus::Processing, progress, stage);
            true
        })
    }

    /// Raise progress from the time-based estimator. Stays out of the way
    /// once the job is at or beyond `guard`.
    pub fn advance_estimate(&self, job_id: &str, progress: u8, guard: u8) -> bool {
        self.write(job_id, |entry| {
            if entry.status != JobStatus::Processing
                || entry.progress >= guard
                || progress <= entry.progress
            {
                return false;
            }
            let stage = entry.stage.clone();
            entry.apply(JobStatus::Processing, progress.min(guard), &stage);
            true
        })
    }

    /// Record a terminal outcome. A job already marked `cancelled` keeps
    /// that status; returns `false` in that case.
    pub fn finish(&self, job_id: &str, status: JobStatus, progress: u8, stage: &str) -> bool {
        self.finish_with(job_id, status, progress, stage, JobOutcome::default())
    }

    /// [`finish`](Self::finish), also storing the outputs or error reason.
    pub fn finish_with(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: u8,
        stage: &str,
        outcome: JobOutcome,
    ) -> bool {
        self.write(job_id, |entry| {
            if entry.status == JobStatus::Cancelled {
                return false;
            }
            entry.apply(status, progress, stage);
            entry.outputs = outcome.outputs;
            entry.error = outcome.error;
            true
        })
    }

    /// Snapshot of a job, or the `unknown` sentinel.
    pub fn get(&self, job_id: &str) -> JobSnapshot {
        match self.entries.read() {
            Ok(entries) => entries
                .get(job_id)
                .map(Entry::snapshot)
                .unwrap_or_else(JobSnapshot::unknown),
            Err(e) => {
                tracing::error!("RwLock poisoned reading job statuses: {e}");
                JobSnapshot::unknown()
            }
        }
    }

    /// Every known job, newest first.
    pub fn list(&self) -> Vec<JobRecord> {
        match self.entries.read() {
            Ok(entries) => {
                let mut rows: Vec<(&String, &Entry)> = entries.iter().collect();
                rows.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at).then(a.0.cmp(b.0)));
                rows.into_iter()
                    .map(|(job_id, entry)| JobRecord {
                        job_id: job_id.clone(),
                        snapshot: entry.snapshot(),
                    })
                    .collect()
            }
            Err(e) => {
                tracing::error!("RwLock poisoned reading job statuses: {e}");
                Vec::new()
            }
        }
    }

    pub fn status(&self, job_id: &str) -> JobStatus {
        self.get(job_id).status
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    /// Run `f` on the job's entry (created as `processing` at 0 if absent)
    /// under the write lock; broadcast if it reports a change.
    fn write(&self, job_id: &str, f: impl FnOnce(&mut Entry) -> bool) -> bool {
        match self.entries.write() {
            Ok(mut entries) => {
                let entry = entries
                    .entry(job_id.to_string())
                    .or_insert_with(|| Entry::new(JobStatus::Processing, 0, ""));
                let changed = f(entry);
                if changed {
                    self.publish(job_id, entry);
                }
                changed
            }
            Err(e) => {
                tracing::error!("RwLock poisoned writing job statuses: {e}");
                false
            }
        }
    }

    fn publish(&self, job_id: &str, entry: &Entry) {
        // No subscribers is fine.
        let _ = self.updates.send(StatusUpdate {
            job_id: job_id.to_string(),
            snapshot: entry.snapshot(),
        });
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn processing(store: &StatusStore, job: &str, pct: u8) {
        assert!(store.try_begin(job, "song.wav", "Uploading file"));
        store.set(job, JobStatus::Processing, pct, "Separating stems");
    }

    #[test]
    fn test_unknown_job() {
        let store = StatusStore::new();
        let snap = store.get("nope");
        assert_eq!(snap.status, JobStatus::Unknown);
        assert_eq!(snap.progress, 0);
        assert_eq!(snap.stage, "Checking status...");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let snap: JobSnapshot =
            serde_json::from_str(&serde_json::to_string(&JobSnapshot::unknown()).unwrap()).unwrap();
        assert_eq!(snap.status, JobStatus::Unknown);
    }

    #[test]
    fn test_try_begin_rejects_active_duplicate() {
        let store = StatusStore::new();
        assert!(store.try_begin("job-1", "song.wav", "Uploading file"));
        assert!(!store.try_begin("job-1", "song.wav", "Uploading file"));

        store.finish("job-1", JobStatus::Failed, 0, "Failed");
        assert!(store.try_begin("job-1", "song.wav", "Uploading file"));
        assert_eq!(store.status("job-1"), JobStatus::Uploading);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let store = StatusStore::new();
        processing(&store, "j", 10);

        assert!(store.advance("j", 40, "Separating stems"));
        assert!(!store.advance("j", 30, "Separating stems"));
        assert!(!store.advance("j", 40, "Separating stems"));
        assert_eq!(store.get("j").progress, 40);
    }

    #[test]
    fn test_set_never_regresses_while_processing() {
        let store = StatusStore::new();
        processing(&store, "j", 60);
        store.set("j", JobStatus::Processing, 20, "Organizing output files");
        let snap = store.get("j");
        assert_eq!(snap.progress, 60);
        assert_eq!(snap.stage, "Organizing output files");
    }

    #[test]
    fn test_advance_ignored_outside_processing() {
        let store = StatusStore::new();
        assert!(store.try_begin("j", "song.wav", "Uploading file"));
        assert!(!store.advance("j", 50, "Separating stems"));
        store.finish("j", JobStatus::Completed, 100, "Completed");
        assert!(!store.advance("j", 99, "Separating stems"));
        assert_eq!(store.get("j").progress, 100);
    }

    #[test]
    fn test_estimate_respects_guard() {
        let store = StatusStore::new();
        processing(&store, "j", 10);

        assert!(store.advance_estimate("j", 50, 85));
        assert_eq!(store.get("j").progress, 50);

        store.advance("j", 86, "Separating stems");
        assert!(!store.advance_estimate("j", 88, 85));
        assert_eq!(store.get("j").progress, 86);
    }

    #[test]
    fn test_estimate_keeps_stage() {
        let store = StatusStore::new();
        processing(&store, "j", 10);
        store.advance_estimate("j", 30, 85);
        assert_eq!(store.get("j").stage, "Separating stems");
    }

    #[test]
    fn test_finish_does_not_override_cancelled() {
        let store = StatusStore::new();
        processing(&store, "j", 50);
        store.set("j", JobStatus::Cancelled, 0, "Cancelled by user");

        assert!(!store.finish("j", JobStatus::Completed, 100, "Completed"));
        let snap = store.get("j");
        assert_eq!(snap.status, JobStatus::Cancelled);
        assert_eq!(snap.progress, 0);
    }

    #[test]
    fn test_update_processing_ignored_after_cancel() {
        let store = StatusStore::new();
        processing(&store, "j", 40);
        assert!(store.update_processing("j", 92, "Organizing output files"));
        assert_eq!(store.get("j").progress, 92);

        store.set("j", JobStatus::Cancelled, 0, "Cancelled by user");
        assert!(!store.update_processing("j", 95, "Cleaning up"));
        assert_eq!(store.status("j"), JobStatus::Cancelled);
    }

    #[test]
    fn test_cancel_resets_progress() {
        let store = StatusStore::new();
        processing(&store, "j", 70);
        store.set("j", JobStatus::Cancelled, 0, "Cancelled by user");
        assert_eq!(store.get("j").progress, 0);
    }

    #[test]
    fn test_completed_record_keeps_outputs() {
        let store = StatusStore::new();
        processing(&store, "j", 80);
        let outputs = BTreeMap::from([("vocals".to_string(), "song_t2s_vocals.wav".to_string())]);
        assert!(store.finish_with(
            "j",
            JobStatus::Completed,
            100,
            "Completed",
            JobOutcome::outputs(outputs.clone()),
        ));

        let snap = store.get("j");
        assert_eq!(snap.outputs, outputs);
        assert_eq!(snap.filename.as_deref(), Some("song.wav"));
        assert!(snap.error.is_none());
        assert!(snap.created_at.is_some());
        assert!(snap.completed_at.is_some());
        assert_eq!(snap.processing_time.as_deref(), Some(snap.elapsed.as_str()));
    }

    #[test]
    fn test_failed_record_keeps_error() {
        let store = StatusStore::new();
        processing(&store, "j", 30);
        store.finish_with(
            "j",
            JobStatus::Failed,
            0,
            "Processing timeout",
            JobOutcome::error("Processing timeout"),
        );

        let json = serde_json::to_value(store.get("j")).unwrap();
        assert_eq!(json["error"], "Processing timeout");
        assert!(json.get("outputs").is_none());
        assert!(json["completed_at"].is_string());
    }

    #[test]
    fn test_active_record_has_no_completion() {
        let store = StatusStore::new();
        processing(&store, "j", 30);
        let snap = store.get("j");
        assert!(snap.completed_at.is_none());
        assert!(snap.processing_time.is_none());
    }

    #[test]
    fn test_rerun_clears_previous_outcome() {
        let store = StatusStore::new();
        processing(&store, "j", 30);
        store.finish_with("j", JobStatus::Failed, 0, "Failed", JobOutcome::error("boom"));

        assert!(store.try_begin("j", "other.wav", "Uploading file"));
        let snap = store.get("j");
        assert!(snap.error.is_none());
        assert!(snap.completed_at.is_none());
        assert_eq!(snap.filename.as_deref(), Some("other.wav"));
    }

    #[test]
    fn test_list_newest_first() {
        let store = StatusStore::new();
        processing(&store, "first", 10);
        std::thread::sleep(std::time::Duration::from_millis(5));
        processing(&store, "second", 10);

        let ids: Vec<String> = store.list().into_iter().map(|r| r.job_id).collect();
        assert_eq!(ids, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let store = StatusStore::new();
        let mut rx = store.subscribe();
        processing(&store, "j", 10);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.job_id, "j");
        assert_eq!(first.snapshot.status, JobStatus::Uploading);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.snapshot.status, JobStatus::Processing);
        assert_eq!(second.snapshot.progress, 10);
    }

    #[test]
    fn test_concurrent_writers_never_regress() {
        let store = Arc::new(StatusStore::new());
        processing(&store, "j", 10);

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        let pct = ((i * 7 + w * 13) % 80 + 10) as u8;
                        if w % 2 == 0 {
                            store.advance("j", pct, "Separating stems");
                        } else {
                            store.advance_estimate("j", pct, 85);
                        }
                    }
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let mut last = 0;
                for _ in 0..500 {
                    let pct = store.get("j").progress;
                    assert!(pct >= last, "progress regressed from {last} to {pct}");
                    last = pct;
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
    }
}
