// crates/server/src/media.rs
//! Mixer/transcoder invocations (ffmpeg).

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use track2stem_core::OutputFormat;

use crate::separation::command::MP3_BITRATE_KBPS;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("media tool timed out after {0}s")]
    Timeout(u64),

    #[error("media tool exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

#[derive(Debug, Clone)]
pub struct MediaTools {
    program: String,
    timeout: Duration,
}

impl MediaTools {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Mix `inputs` into one track at `output`, encoded as `format`.
    pub async fn mix(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        format: OutputFormat,
    ) -> Result<(), MediaError> {
        self.run(mix_args(inputs, output, format)).await
    }

    /// Re-encode `input` as `format` at `output`.
    pub async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        format: OutputFormat,
    ) -> Result<(), MediaError> {
        self.run(transcode_args(input, output, format)).await
    }

    async fn run(&self, args: Vec<OsString>) -> Result<(), MediaError> {
        let t0 = Instant::now();
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                tracing::error!(program = %self.program, elapsed_ms = t0.elapsed().as_millis() as u64, "media tool timed out");
                MediaError::Timeout(self.timeout.as_secs())
            })?
            .map_err(|e| {
                tracing::error!(program = %self.program, error = %e, "media tool failed to spawn");
                MediaError::Spawn {
                    program: self.program.clone(),
                    reason: e.to_string(),
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let tail = &stderr[floor_boundary(stderr, stderr.len().saturating_sub(500))..];
            tracing::warn!(program = %self.program, exit_code = ?output.status.code(), stderr = %tail, "media tool non-zero exit");
            return Err(MediaError::Failed {
                code: output.status.code(),
                stderr: tail.to_string(),
            });
        }
        tracing::debug!(program = %self.program, elapsed_ms = t0.elapsed().as_millis() as u64, "media tool done");
        Ok(())
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn codec_args(format: OutputFormat) -> Vec<OsString> {
    match format {
        OutputFormat::Mp3 => vec![
            "-c:a".into(),
            "libmp3lame".into(),
            "-b:a".into(),
            format!("{MP3_BITRATE_KBPS}k").into(),
        ],
        OutputFormat::Wav => vec!["-c:a".into(), "pcm_s16le".into()],
        OutputFormat::Flac => vec!["-c:a".into(), "flac".into()],
    }
}

fn base_args() -> Vec<OsString> {
    ["-y", "-hide_banner", "-loglevel", "error"]
        .iter()
        .map(OsString::from)
        .collect()
}

/// `-i a -i b ... -filter_complex amix=inputs=N:duration=longest:normalize=1`
pub fn mix_args(inputs: &[PathBuf], output: &Path, format: OutputFormat) -> Vec<OsString> {
    let mut args = base_args();
    for input in inputs {
        args.push("-i".into());
        args.push(input.as_os_str().to_owned());
    }
    args.push("-filter_complex".into());
    args.push(format!("amix=inputs={}:duration=longest:normalize=1", inputs.len()).into());
    args.extend(codec_args(format));
    args.push(output.as_os_str().to_owned());
    args
}

pub fn transcode_args(input: &Path, output: &Path, format: OutputFormat) -> Vec<OsString> {
    let mut args = base_args();
    args.push("-i".into());
    args.push(input.as_os_str().to_owned());
    args.extend(codec_args(format));
    args.push(output.as_os_str().to_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_mix_args() {
        let args = mix_args(
            &[PathBuf::from("/s/drums.wav"), PathBuf::from("/s/bass.wav")],
            Path::new("/o/x_t2s_instrumental.mp3"),
            OutputFormat::Mp3,
        );
        let args = strings(&args);
        assert!(args.windows(2).any(|w| w == ["-i", "/s/drums.wav"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/s/bass.wav"]));
        assert!(args.contains(&"amix=inputs=2:duration=longest:normalize=1".to_string()));
        assert!(args.windows(2).any(|w| w == ["-b:a", "320k"]));
        assert_eq!(args.last().unwrap(), "/o/x_t2s_instrumental.mp3");
    }

    #[test]
    fn test_transcode_args_flac() {
        let args = strings(&transcode_args(
            Path::new("/o/a.wav"),
            Path::new("/o/a.flac"),
            OutputFormat::Flac,
        ));
        assert_eq!(
            args,
            vec!["-y", "-hide_banner", "-loglevel", "error", "-i", "/o/a.wav", "-c:a", "flac", "/o/a.flac"]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let tools = MediaTools::new("/nonexistent/ffmpeg", Duration::from_secs(5));
        let err = tools
            .transcode(Path::new("/a.wav"), Path::new("/a.flac"), OutputFormat::Flac)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-ffmpeg");
        std::fs::write(&script, "#!/bin/sh\necho 'Invalid data found' >&2\nexit 1\n").unwrap();
        make_executable(&script);

        let tools = MediaTools::new(script.to_string_lossy(), Duration::from_secs(5));
        let err = tools
            .transcode(Path::new("/a.wav"), Path::new("/a.flac"), OutputFormat::Flac)
            .await
            .unwrap_err();
        match err {
            MediaError::Failed { code, stderr } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("Invalid data found"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("slow-ffmpeg");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        make_executable(&script);

        let tools = MediaTools::new(script.to_string_lossy(), Duration::from_millis(200));
        let err = tools
            .transcode(Path::new("/a.wav"), Path::new("/a.flac"), OutputFormat::Flac)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Timeout(_)));
    }

    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
