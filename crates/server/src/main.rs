// crates/server/src/main.rs
//! track2stem server binary.
//!
//! Parses configuration, initializes logging, creates the upload and output
//! roots, then serves until Ctrl-C / SIGTERM. Separation processes still
//! alive at shutdown are terminated before the server drains.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use track2stem_observability::init_tracing;
use track2stem_server::{create_app, AppState, Config};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    let _guard = init_tracing(&config.log_config())?;
    let startup_start = Instant::now();

    config.validate()?;
    config.ensure_dirs()?;

    let address = config.address();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %address,
        upload_dir = %config.upload_dir.display(),
        output_dir = %config.output_dir.display(),
        demucs = %config.demucs_bin,
        ffmpeg = %config.ffmpeg_bin,
        timeout_secs = config.separation_timeout_secs,
        "starting track2stem"
    );

    let state = AppState::new(config);
    let app = create_app(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    tracing::info!(
        address = %address,
        startup_ms = startup_start.elapsed().as_millis() as u64,
        "listening"
    );

    // Kill live separations first so in-flight /process requests can finish.
    let on_shutdown = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            on_shutdown.shutdown_processes().await;
        })
        .await?;

    tracing::info!(uptime_secs = state.uptime_secs(), "server stopped");
    Ok(())
}
