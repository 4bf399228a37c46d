// crates/server/src/layout.rs
//! Where a job's files live.
//!
//! ```text
//! <upload_dir>/<job_id>_<name>.<ext>           uploaded input
//! <output_dir>/<model>/<job_id>_<name>/         tool output (intermediate)
//! <output_dir>/jobs/<job_id>/<name>_t2s_<stem>.<fmt> final results
//! ```
//!
//! Final results sit under their own `jobs/` subtree so a job id can never
//! name a model's output root.

use std::path::{Path, PathBuf};

use track2stem_core::{file_stem, safe_path, stored_upload_name, Model, SandboxError, Stem};

/// Directory under the output root holding every job's final results.
pub const JOBS_DIR: &str = "jobs";

/// `<output_dir>/jobs/<job_id>`.
pub fn job_output_dir(output_dir: &Path, job_id: &str) -> Result<PathBuf, SandboxError> {
    safe_path(output_dir, [JOBS_DIR, job_id])
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobLayout {
    pub job_id: String,
    /// Sanitized client file name without extension.
    pub base_name: String,
    pub input: PathBuf,
    /// Canonical output root handed to the tool.
    pub output_root: PathBuf,
    pub job_output: PathBuf,
    pub model_root: PathBuf,
    /// Directory the tool is expected to write stems to.
    pub intermediate: PathBuf,
}

impl JobLayout {
    /// Resolve every path for a job. `filename` must already be sanitized.
    pub fn new(
        upload_dir: &Path,
        output_dir: &Path,
        job_id: &str,
        filename: &str,
        model: Model,
    ) -> Result<Self, SandboxError> {
        let stored = stored_upload_name(job_id, filename);
        let model_root = safe_path(output_dir, [model.as_str()])?;
        Ok(Self {
            job_id: job_id.to_string(),
            base_name: file_stem(filename).to_string(),
            input: safe_path(upload_dir, [stored.as_str()])?,
            output_root: safe_path(output_dir, std::iter::empty::<&str>())?,
            job_output: job_output_dir(output_dir, job_id)?,
            intermediate: safe_path(output_dir, [model.as_str(), file_stem(&stored)])?,
            model_root,
        })
    }

    /// Final file name for one stem or mix.
    pub fn output_name(&self, track: &str, extension: &str) -> String {
        format!("{}_t2s_{}.{}", self.base_name, track, extension)
    }

    pub fn output_path(&self, track: &str, extension: &str) -> Result<PathBuf, SandboxError> {
        safe_path(
            &self.output_root,
            [JOBS_DIR, self.job_id.as_str(), &self.output_name(track, extension)],
        )
    }

    /// Candidate file for `stem` inside a tool output directory.
    pub fn stem_file(dir: &Path, stem: Stem, extension: &str) -> Result<PathBuf, SandboxError> {
        safe_path(dir, [format!("{}.{}", stem.as_str(), extension)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_layout_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let up = tmp.path().join("up");
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&up).unwrap();
        std::fs::create_dir_all(&out).unwrap();

        let layout = JobLayout::new(&up, &out, "abc-123", "My_Song.mp3", Model::Htdemucs).unwrap();
        let out = out.canonicalize().unwrap();
        let up = up.canonicalize().unwrap();

        assert_eq!(layout.base_name, "My_Song");
        assert_eq!(layout.input, up.join("abc-123_My_Song.mp3"));
        assert_eq!(layout.output_root, out);
        assert_eq!(layout.job_output, out.join("jobs").join("abc-123"));
        assert_eq!(layout.model_root, out.join("htdemucs"));
        assert_eq!(layout.intermediate, out.join("htdemucs").join("abc-123_My_Song"));
        assert_eq!(
            layout.output_path("vocals", "wav").unwrap(),
            out.join("jobs").join("abc-123").join("My_Song_t2s_vocals.wav")
        );
    }

    #[test]
    fn test_model_named_job_keeps_own_output_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let up = tmp.path().join("up");
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&up).unwrap();
        std::fs::create_dir_all(&out).unwrap();

        for model in [Model::Htdemucs, Model::Mdx] {
            let layout = JobLayout::new(&up, &out, model.as_str(), "a.wav", model).unwrap();
            assert_ne!(layout.job_output, layout.model_root);
            assert!(!layout.model_root.starts_with(&layout.job_output));
            assert!(!layout.job_output.starts_with(&layout.model_root));
        }
    }

    #[test]
    fn test_missing_root_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = JobLayout::new(
            &tmp.path().join("nope"),
            tmp.path(),
            "j",
            "a.mp3",
            Model::Htdemucs,
        )
        .unwrap_err();
        assert!(!err.is_traversal());
    }
}
