use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use smart_backup_core::RunOutcome;
use smart_backup_daemon::config::{self, Config};
use smart_backup_daemon::{add_paths, build_router, run_backup, scheduler_loop, AppState};
use smart_backup_storage::{SettingsStore, DEFAULT_SETTINGS_FILE};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (cfg, mode) = parse_args()?;

    let settings_path = env::var("SMART_BACKUP_SETTINGS")
        .ok()
        .map(PathBuf::from)
        .or_else(|| cfg.settings.path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));

    let listen = env::var("SMART_BACKUP_LISTEN")
        .ok()
        .or_else(|| cfg.server.listen.clone())
        .unwrap_or_else(|| "127.0.0.1:8089".to_owned());

    let api_token = env::var("SMART_BACKUP_API_TOKEN")
        .ok()
        .or_else(|| cfg.security.api_token.clone());

    let store = SettingsStore::new(settings_path);
    let settings = store.load();
    if let Err(e) = std::fs::create_dir_all(&settings.destination) {
        warn!(destination = %settings.destination.display(), error = %e, "could not create backup destination");
    }
    info!(
        settings = %store.path().display(),
        destination = %settings.destination.display(),
        auto_backup = settings.auto_backup,
        interval_secs = settings.interval_secs,
        "settings loaded"
    );

    let state = AppState::new(store, settings, api_token);
    for source in &cfg.sources {
        let inserted = add_paths(&state, vec![source.path.clone()], source.recursive).await?;
        info!(path = %source.path.display(), inserted, "added configured source");
    }

    match mode.as_deref() {
        Some("run-once") => run_once(state).await,
        None => run_service(state, &listen).await,
        Some(other) => bail!("unknown command: {other}"),
    }
}

/// Parse CLI args, returning the loaded config and optional subcommand.
fn parse_args() -> Result<(Config, Option<String>)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut mode: Option<String> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other => {
                mode = Some(other.to_owned());
            }
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, mode))
}

async fn run_once(state: AppState) -> Result<()> {
    match run_backup(&state).await? {
        RunOutcome::Completed(report) => {
            for failed in report.failures() {
                warn!(source = %failed.source.display(), "not backed up");
            }
            info!(
                snapshot = %report.snapshot_dir.display(),
                success = report.success,
                total = report.total,
                "backup finished"
            );
        }
        RunOutcome::Empty => info!("no items to backup"),
        RunOutcome::Busy => warn!("backup already in progress"),
    }
    Ok(())
}

async fn run_service(state: AppState, listen: &str) -> Result<()> {
    tokio::spawn(scheduler_loop(state.clone()));

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address: {listen}"))?;
    let app = build_router(state);

    info!(%addr, "starting backup control API");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
