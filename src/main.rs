#![forbid(unsafe_code)]

//! `agent-conductor` - orchestration server binary.
//!
//! Bootstraps configuration and the database, restores persisted groups and
//! queues, then serves the IPC control plane and the HTTP/SSE push transport
//! until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conductor::config::GlobalConfig;
use agent_conductor::conductor::Conductor;
use agent_conductor::http;
use agent_conductor::ipc::server::spawn_ipc_server;
use agent_conductor::orchestrator::spawner::{ProcessLauncher, SpawnConfig};
use agent_conductor::persistence::db;
use agent_conductor::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conductor", about = "Agent session orchestration server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the default project root.
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Run without a database; nothing is restored or saved.
    #[arg(long)]
    ephemeral: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-conductor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(root) = args.project_root {
        let canonical = root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid project root override: {err}")))?;
        config.default_project_root = canonical;
    }
    info!(ipc_name = %config.ipc_name, http_port = config.http_port, "configuration loaded");

    // ── Build the engine ────────────────────────────────
    let launcher = Arc::new(ProcessLauncher::new(SpawnConfig::from_global(&config)));
    let db_path = config.db_path();
    let mut conductor = Conductor::start(config, launcher);

    if args.ephemeral {
        info!("running without persistence");
    } else {
        let pool = Arc::new(db::connect(&db_path).await?);
        info!(db_path = %db_path.display(), "database connected");
        conductor.attach_store(pool).await?;
    }
    let conductor = Arc::new(conductor);
    let ct = conductor.cancellation();

    // ── Start transports ────────────────────────────────
    let ipc_handle = spawn_ipc_server(Arc::clone(&conductor), ct.clone())?;

    let http_ct = ct.clone();
    let http_conductor = Arc::clone(&conductor);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve_http(http_conductor, http_ct).await {
            error!(%err, "http transport failed");
        }
    });

    info!("agent-conductor ready");

    // ── Wait for shutdown ───────────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    if let Err(err) = conductor.shutdown().await {
        error!(%err, "error while persisting final state");
    }

    let _ = tokio::join!(ipc_handle, http_handle);
    info!("agent-conductor shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
