//! quill-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables and CLI flags.
//! 2. Initialise structured tracing (JSON or pretty, stdout or rolling file).
//! 3. Load and validate model settings; every configuration error is fatal
//!    here, before any request is served.
//! 4. Build the Axum router and start the HTTP server with graceful shutdown.

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use quill_core::Settings;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::Config;
use crate::state::AppState;

/// OpenAI-compatible chat front-end for local text-generation engines.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Address to bind; overrides QUILL_BIND.
    #[arg(long)]
    bind: Option<String>,

    /// Settings file (TOML, or JSON by extension); overrides QUILL_SETTINGS.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut cfg = Config::from_env();
    if let Some(bind) = cli.bind {
        cfg.bind_address = bind;
    }
    if let Some(path) = cli.settings {
        cfg.settings_path = Some(path);
    }

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: QUILL_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    // The guard flushes the file writer on drop; it must outlive the server.
    let (writer, _log_guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "quill-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "quill-server starting");

    // ── 3. Model settings ──────────────────────────────────────────────────────
    let settings = match &cfg.settings_path {
        Some(path) => Settings::load(path)?,
        None => {
            info!("no settings file configured; using built-in defaults");
            Settings::default()
        }
    };
    let state = Arc::new(AppState::new(cfg.clone(), &settings)?);
    info!(models = state.services().len(), "chat services ready");

    // ── 4. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("quill-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
