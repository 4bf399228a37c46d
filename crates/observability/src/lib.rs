//! Process-wide tracing setup for the track2stem service.
//!
//! - `RUST_LOG` (or the configured default directive) drives an `EnvFilter`
//! - stderr output is compact text, or one JSON object per line
//! - an optional daily-rolling log file receives the same events as JSON

use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "info,tower_http=warn";

/// Logging options, usually taken from the server `Config`.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub directive: Option<String>,
    /// Emit JSON lines on stderr instead of compact text.
    pub json: bool,
    /// Directory for a daily-rolling `track2stem.log`.
    pub log_dir: Option<PathBuf>,
}

/// Keeps the file writer flushing until dropped. Hold it for the life of `main`.
#[must_use = "dropping the guard stops the file writer"]
pub struct TracingGuard {
    _file: Option<WorkerGuard>,
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.directive.as_deref().unwrap_or(DEFAULT_DIRECTIVE))
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<TracingGuard> {
    let stderr_layer = if config.json {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().compact().with_writer(std::io::stderr).boxed()
    };

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "track2stem.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(env_filter(config))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(TracingGuard { _file: file_guard })
}
