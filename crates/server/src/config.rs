// crates/server/src/config.rs
//! Service configuration: CLI flags with environment fallbacks.
//!
//! ```bash
//! track2stem --port 5000 --upload-dir /app/uploads --output-dir /app/outputs
//! PORT=5000 DEMUCS_BIN=/opt/demucs/bin/demucs track2stem
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use track2stem_observability::LogConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "track2stem")]
#[command(about = "Audio stem separation job service")]
#[command(version)]
pub struct Config {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 5000, env = "PORT")]
    pub port: u16,

    /// Directory uploaded inputs are written to.
    #[arg(long, default_value = "./uploads", env = "TRACK2STEM_UPLOAD_DIR")]
    pub upload_dir: PathBuf,

    /// Root handed to the separation tool; per-job results live below it too.
    #[arg(long, default_value = "./outputs", env = "TRACK2STEM_OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Separation tool executable.
    #[arg(long, default_value = "demucs", env = "DEMUCS_BIN")]
    pub demucs_bin: String,

    /// Mixer/transcoder executable.
    #[arg(long, default_value = "ffmpeg", env = "FFMPEG_BIN")]
    pub ffmpeg_bin: String,

    /// Wall-clock ceiling for one separation run.
    #[arg(long, default_value_t = 1800, env = "TRACK2STEM_TIMEOUT_SECS")]
    pub separation_timeout_secs: u64,

    /// Baseline run time used by the time-based progress estimator.
    #[arg(long, default_value_t = 240, env = "TRACK2STEM_ESTIMATED_SECS")]
    pub estimated_duration_secs: u64,

    /// Estimator tick.
    #[arg(long, default_value_t = 3000)]
    pub estimator_interval_ms: u64,

    /// How often the supervisor checks the child for exit.
    #[arg(long, default_value_t = 200)]
    pub exit_poll_interval_ms: u64,

    /// How long teardown waits for each progress reader before detaching it.
    #[arg(long, default_value_t = 2000)]
    pub reader_join_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL when cancelling.
    #[arg(long, default_value_t = 3000)]
    pub cancel_grace_ms: u64,

    /// Ceiling for each mixer/transcoder invocation.
    #[arg(long, default_value_t = 600)]
    pub media_tool_timeout_secs: u64,

    /// Largest accepted upload.
    #[arg(long, default_value_t = 100, env = "TRACK2STEM_MAX_UPLOAD_MB")]
    pub max_upload_mb: u64,

    /// Log as JSON lines.
    #[arg(long, env = "TRACK2STEM_LOG_JSON")]
    pub log_json: bool,

    /// Also write a daily-rolling log file here.
    #[arg(long, env = "TRACK2STEM_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.separation_timeout_secs == 0 {
            bail!("separation timeout must be > 0");
        }
        if self.estimated_duration_secs == 0 {
            bail!("estimated duration must be > 0");
        }
        if self.estimator_interval_ms == 0 || self.exit_poll_interval_ms == 0 {
            bail!("polling intervals must be > 0");
        }
        if self.max_upload_mb == 0 {
            bail!("max upload size must be >= 1 MB");
        }
        if self.demucs_bin.trim().is_empty() || self.ffmpeg_bin.trim().is_empty() {
            bail!("tool executables must be set");
        }
        Ok(())
    }

    /// Create the upload and output roots if missing.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.upload_dir, &self.output_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            directive: None,
            json: self.log_json,
            log_dir: self.log_dir.clone(),
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        usize::try_from(self.max_upload_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn separation_timeout(&self) -> Duration {
        Duration::from_secs(self.separation_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn media_tool_timeout(&self) -> Duration {
        Duration::from_secs(self.media_tool_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            upload_dir: PathBuf::from("./uploads"),
            output_dir: PathBuf::from("./outputs"),
            demucs_bin: "demucs".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            separation_timeout_secs: 1800,
            estimated_duration_secs: 240,
            estimator_interval_ms: 3000,
            exit_poll_interval_ms: 200,
            reader_join_timeout_ms: 2000,
            cancel_grace_ms: 3000,
            media_tool_timeout_secs: 600,
            max_upload_mb: 100,
            log_json: false,
            log_dir: None,
        }
    }
}
