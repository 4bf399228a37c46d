// crates/server/src/assemble.rs
//! Turns the tool's intermediate directory into the job's final files.
//!
//! - locate the directory the tool actually wrote (it derives the name from
//!   the input file, so a fallback scan exists for when that drifts)
//! - move each wanted stem to `<job_output>/<name>_t2s_<stem>.<fmt>`
//! - in isolate mode, mix the other stems into one backing track
//! - transcode anything that is not yet in the requested format

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use track2stem_core::{OutputFormat, SandboxError, SeparationOptions, Stem, StemMode};

use crate::jobs::StatusStore;
use crate::layout::JobLayout;
use crate::media::{MediaError, MediaTools};

/// Progress shown while organizing results.
pub const ASSEMBLY_PROGRESS: u8 = 92;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("separation output not found under {0}")]
    OutputMissing(PathBuf),

    #[error("stem {0} missing from separation output")]
    StemMissing(Stem),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("converting {path} to {format}: {source}")]
    Conversion {
        path: PathBuf,
        format: OutputFormat,
        #[source]
        source: MediaError,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> AssemblyError + '_ {
    move |source| AssemblyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Final files keyed by track name (`vocals`, `instrumental`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledOutput {
    pub files: BTreeMap<String, PathBuf>,
    /// The directory the stems were found in, for cleanup.
    pub source_dir: PathBuf,
}

impl AssembledOutput {
    /// Track name to file name, as returned to the client.
    pub fn file_names(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .filter_map(|(track, path)| {
                path.file_name()
                    .map(|name| (track.clone(), name.to_string_lossy().into_owned()))
            })
            .collect()
    }
}

pub struct Assembler<'a> {
    media: &'a MediaTools,
    statuses: &'a StatusStore,
}

impl<'a> Assembler<'a> {
    pub fn new(media: &'a MediaTools, statuses: &'a StatusStore) -> Self {
        Self { media, statuses }
    }

    pub async fn assemble(
        &self,
        layout: &JobLayout,
        options: &SeparationOptions,
    ) -> Result<AssembledOutput, AssemblyError> {
        let job_id = layout.job_id.as_str();
        let source_dir = locate_output_dir(layout)?;
        tokio::fs::create_dir_all(&layout.job_output)
            .await
            .map_err(io_err(&layout.job_output))?;

        let format = options.output_format;
        let wanted: &[Stem] = match options.stem_mode {
            StemMode::All => options.stems(),
            StemMode::Isolate => std::slice::from_ref(&options.isolate_stem),
        };

        let mut output = AssembledOutput {
            files: BTreeMap::new(),
            source_dir: source_dir.clone(),
        };

        for &stem in wanted {
            let Some((found, ext)) = find_stem_file(&source_dir, stem, format)? else {
                if options.stem_mode == StemMode::Isolate {
                    return Err(AssemblyError::StemMissing(stem));
                }
                tracing::warn!(job_id, stem = %stem, "stem missing from separation output");
                continue;
            };

            let dest = layout.output_path(stem.as_str(), ext)?;
            move_file(&found, &dest).await?;
            let final_path = if ext == format.extension() {
                dest
            } else {
                self.convert(job_id, layout, stem.as_str(), &dest, format).await?
            };
            output.files.insert(stem.as_str().to_string(), final_path);
        }

        if output.files.is_empty() {
            return Err(AssemblyError::OutputMissing(source_dir));
        }

        if options.stem_mode == StemMode::Isolate {
            self.mix_backing(layout, options, &source_dir, &mut output).await?;
        }

        tracing::info!(job_id, files = output.files.len(), "outputs assembled");
        Ok(output)
    }

    /// Transcode `path` to `format`, removing the original only on success.
    async fn convert(
        &self,
        job_id: &str,
        layout: &JobLayout,
        track: &str,
        path: &Path,
        format: OutputFormat,
    ) -> Result<PathBuf, AssemblyError> {
        self.statuses.update_processing(
            job_id,
            ASSEMBLY_PROGRESS,
            &format!("Converting to {}", format.as_str().to_uppercase()),
        );
        let target = layout.output_path(track, format.extension())?;
        self.media
            .transcode(path, &target, format)
            .await
            .map_err(|source| AssemblyError::Conversion {
                path: path.to_path_buf(),
                format,
                source,
            })?;
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(job_id, path = %path.display(), error = %e, "removing pre-conversion file");
        }
        Ok(target)
    }

    /// Mix every stem but the isolated one. Failure only costs the backing
    /// track; the isolated stem is still delivered.
    async fn mix_backing(
        &self,
        layout: &JobLayout,
        options: &SeparationOptions,
        source_dir: &Path,
        output: &mut AssembledOutput,
    ) -> Result<(), AssemblyError> {
        let job_id = layout.job_id.as_str();
        let format = options.output_format;
        let mut inputs = Vec::new();
        for &stem in options.stems() {
            if stem == options.isolate_stem {
                continue;
            }
            match find_stem_file(source_dir, stem, format)? {
                Some((path, _)) => inputs.push(path),
                None => tracing::warn!(job_id, stem = %stem, "stem missing, left out of mix"),
            }
        }
        if inputs.is_empty() {
            tracing::warn!(job_id, "no stems to mix, skipping backing track");
            return Ok(());
        }

        let name = options.backing_track_name();
        self.statuses.update_processing(
            job_id,
            ASSEMBLY_PROGRESS,
            &format!("Creating {name} track"),
        );
        let target = layout.output_path(name, format.extension())?;
        match self.media.mix(&inputs, &target, format).await {
            Ok(()) if target.is_file() => {
                output.files.insert(name.to_string(), target);
            }
            Ok(()) => {
                tracing::warn!(job_id, path = %target.display(), "mixer produced no file");
            }
            Err(e) => {
                tracing::warn!(job_id, error = %e, "mixing backing track failed");
                if let Err(e) = tokio::fs::remove_file(&target).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::debug!(job_id, error = %e, "removing partial mix");
                    }
                }
            }
        }
        Ok(())
    }
}

/// The expected intermediate directory, or a fallback under the model root:
/// an entry prefixed with `<job_id>_`, else the first directory by name.
pub fn locate_output_dir(layout: &JobLayout) -> Result<PathBuf, AssemblyError> {
    if layout.intermediate.is_dir() {
        return Ok(layout.intermediate.clone());
    }

    let entries = match std::fs::read_dir(&layout.model_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(AssemblyError::OutputMissing(layout.intermediate.clone()))
        }
        Err(e) => return Err(io_err(&layout.model_root)(e)),
    };
    let mut dirs: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    dirs.sort();

    let prefix = format!("{}_", layout.job_id);
    let chosen = dirs
        .iter()
        .find(|name| name.starts_with(&prefix))
        .or_else(|| dirs.first())
        .ok_or_else(|| AssemblyError::OutputMissing(layout.intermediate.clone()))?;

    tracing::warn!(
        job_id = %layout.job_id,
        expected = %layout.intermediate.display(),
        chosen = %chosen,
        "expected output directory missing, using fallback"
    );
    Ok(track2stem_core::safe_path(&layout.model_root, [chosen.as_str()])?)
}

/// Look for `<stem>.<ext>` trying the format's native extension first.
fn find_stem_file(
    dir: &Path,
    stem: Stem,
    format: OutputFormat,
) -> Result<Option<(PathBuf, &'static str)>, SandboxError> {
    let mut candidates = vec![format.native_extension()];
    for ext in ["wav", "mp3", "flac"] {
        if !candidates.contains(&ext) {
            candidates.push(ext);
        }
    }
    for ext in candidates {
        let path = JobLayout::stem_file(dir, stem, ext)?;
        if path.is_file() {
            return Ok(Some((path, ext)));
        }
    }
    Ok(None)
}

async fn move_file(from: &Path, to: &Path) -> Result<(), AssemblyError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // Rename fails across filesystems.
    tokio::fs::copy(from, to).await.map_err(io_err(to))?;
    tokio::fs::remove_file(from).await.map_err(io_err(from))?;
    Ok(())
}
