// crates/server/src/cleanup.rs
//! Best-effort removal of everything a job leaves behind.
//!
//! Each step is attempted regardless of earlier failures; failures are
//! logged and counted, never raised.

use std::io;
use std::path::{Path, PathBuf};

use crate::jobs::ProcessRegistry;
use crate::layout::JobLayout;

/// What cleanup should do with the job's final output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outputs {
    Keep,
    Remove,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failures: usize,
}

impl CleanupReport {
    fn record(&mut self, job_id: &str, path: &Path, result: io::Result<bool>) {
        match result {
            Ok(true) => self.removed.push(path.to_path_buf()),
            Ok(false) => {}
            Err(e) => {
                self.failures += 1;
                tracing::warn!(job_id, path = %path.display(), error = %e, "cleanup step failed");
            }
        }
    }
}

/// Remove the job's intermediates, input and registry entry; with
/// [`Outputs::Remove`] also its final output directory.
///
/// `extra_dir` is a fallback intermediate directory discovered during
/// assembly, if it differs from the expected one. It is only deleted when
/// it sits directly under the model root and carries the `<job_id>_` prefix.
pub fn cleanup_job(
    layout: &JobLayout,
    extra_dir: Option<&Path>,
    processes: &ProcessRegistry,
    outputs: Outputs,
) -> CleanupReport {
    let job_id = layout.job_id.as_str();
    let mut report = CleanupReport::default();

    report.record(job_id, &layout.intermediate, remove_dir_all(&layout.intermediate));
    if let Some(dir) = extra_dir.filter(|d| *d != layout.intermediate.as_path()) {
        if owns_fallback(layout, dir) {
            report.record(job_id, dir, remove_dir_all(dir));
        } else {
            tracing::warn!(job_id, path = %dir.display(), "leaving fallback directory not named for this job");
        }
    }
    report.record(job_id, &layout.model_root, remove_dir_if_empty(&layout.model_root));
    report.record(job_id, &layout.input, remove_file(&layout.input));

    if let Some(handle) = processes.remove(job_id) {
        tracing::warn!(job_id, pid = ?handle.pid(), "process still registered at cleanup, killing");
        handle.abort();
    }

    if outputs == Outputs::Remove {
        report.record(job_id, &layout.job_output, remove_dir_all(&layout.job_output));
    }

    tracing::debug!(
        job_id,
        removed = report.removed.len(),
        failures = report.failures,
        "cleanup finished"
    );
    report
}

fn owns_fallback(layout: &JobLayout, dir: &Path) -> bool {
    let prefix = format!("{}_", layout.job_id);
    dir.parent() == Some(layout.model_root.as_path())
        && dir
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(&prefix))
}

fn remove_dir_all(path: &Path) -> io::Result<bool> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn remove_file(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn remove_dir_if_empty(path: &Path) -> io::Result<bool> {
    let mut entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if entries.next().is_some() {
        return Ok(false);
    }
    match std::fs::remove_dir(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        // Another job wrote into it meanwhile.
        Err(_) if has_entries(path) => Ok(false),
        Err(e) => Err(e),
    }
}

fn has_entries(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use track2stem_core::Model;

    fn layout(tmp: &Path, job_id: &str) -> JobLayout {
        let up = tmp.join("up");
        let out = tmp.join("out");
        std::fs::create_dir_all(&up).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        JobLayout::new(&up, &out, job_id, "song.wav", Model::Htdemucs).unwrap()
    }

    fn populate(layout: &JobLayout) {
        std::fs::write(&layout.input, b"audio").unwrap();
        std::fs::create_dir_all(&layout.intermediate).unwrap();
        std::fs::write(layout.intermediate.join("vocals.wav"), b"v").unwrap();
        std::fs::create_dir_all(&layout.job_output).unwrap();
        std::fs::write(layout.job_output.join("song_t2s_vocals.wav"), b"v").unwrap();
    }

    #[test]
    fn test_success_keeps_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path(), "ok");
        populate(&layout);

        let report = cleanup_job(&layout, None, &ProcessRegistry::new(), Outputs::Keep);

        assert_eq!(report.failures, 0);
        assert!(!layout.input.exists());
        assert!(!layout.intermediate.exists());
        assert!(!layout.model_root.exists());
        assert!(layout.job_output.join("song_t2s_vocals.wav").is_file());
    }

    #[test]
    fn test_failure_removes_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path(), "bad");
        populate(&layout);

        cleanup_job(&layout, None, &ProcessRegistry::new(), Outputs::Remove);
        assert!(!layout.job_output.exists());
        assert!(!layout.input.exists());
    }

    #[test]
    fn test_model_root_shared_with_other_job_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path(), "mine");
        populate(&layout);
        let other = layout.model_root.join("other_job");
        std::fs::create_dir_all(&other).unwrap();

        cleanup_job(&layout, None, &ProcessRegistry::new(), Outputs::Keep);
        assert!(other.is_dir());
        assert!(!layout.intermediate.exists());
    }

    #[test]
    fn test_fallback_dir_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path(), "fb");
        let fallback = layout.model_root.join("fb_renamed");
        std::fs::create_dir_all(&fallback).unwrap();

        cleanup_job(&layout, Some(&fallback), &ProcessRegistry::new(), Outputs::Keep);
        assert!(!fallback.exists());
        assert!(!layout.model_root.exists());
    }

    #[test]
    fn test_foreign_fallback_dir_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path(), "fb");
        let foreign = layout.model_root.join("other_song");
        std::fs::create_dir_all(&foreign).unwrap();
        std::fs::write(foreign.join("vocals.wav"), b"v").unwrap();

        cleanup_job(&layout, Some(&foreign), &ProcessRegistry::new(), Outputs::Keep);
        assert!(foreign.join("vocals.wav").is_file());
        assert!(layout.model_root.is_dir());
    }

    #[test]
    fn test_model_named_job_failure_spares_other_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let other = layout(tmp.path(), "other-job");
        populate(&other);
        let named = layout(tmp.path(), "htdemucs");
        populate(&named);
        assert_ne!(named.job_output, named.model_root);

        cleanup_job(&named, None, &ProcessRegistry::new(), Outputs::Remove);

        assert!(!named.job_output.exists());
        assert!(!named.intermediate.exists());
        assert!(other.intermediate.join("vocals.wav").is_file());
        assert!(other.job_output.join("song_t2s_vocals.wav").is_file());
    }

    #[test]
    fn test_nothing_to_clean_is_quiet() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = layout(tmp.path(), "empty");

        let report = cleanup_job(&layout, None, &ProcessRegistry::new(), Outputs::Remove);
        assert_eq!(report.failures, 0);
        assert!(report.removed.is_empty());
    }
}
