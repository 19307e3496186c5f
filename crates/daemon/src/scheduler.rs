use std::time::Duration;

use anyhow::{Context, Result};
use smart_backup_core::RunOutcome;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::server::AppState;

/// Delay before the published progress fraction drops back to zero after a run.
const PROGRESS_RESET_DELAY: Duration = Duration::from_secs(3);

/// Runs one backup off the async runtime against a copy of the current catalog
/// and settings. Returns `Busy` without doing anything if a run is in progress.
pub async fn run_backup(state: &AppState) -> Result<RunOutcome> {
    if state.engine.is_running() {
        return Ok(RunOutcome::Busy);
    }

    let catalog = state.catalog.lock().await.clone();
    let settings = state.settings.lock().await.clone();
    let engine = state.engine.clone();
    let board = state.board.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        engine.run(&catalog, &settings, &*board, &*board)
    })
    .await
    .context("backup task failed")?;

    if matches!(outcome, RunOutcome::Completed(_)) {
        let engine = state.engine.clone();
        let board = state.board.clone();
        tokio::spawn(async move {
            sleep(PROGRESS_RESET_DELAY).await;
            if !engine.is_running() {
                board.reset_progress();
            }
        });
    }
    Ok(outcome)
}

/// Auto-backup timer. Each tick starts a run when `auto_backup` is on; a tick
/// that finds a run in progress is dropped. Settings updates re-arm the timer.
pub async fn scheduler_loop(state: AppState) {
    loop {
        let interval = state.settings.lock().await.interval();
        tokio::select! {
            _ = sleep(interval) => {}
            _ = state.rearm.notified() => {
                debug!("auto-backup timer re-armed");
                continue;
            }
        }

        if !state.settings.lock().await.auto_backup {
            continue;
        }

        match run_backup(&state).await {
            Ok(RunOutcome::Completed(report)) => info!(
                snapshot = %report.snapshot_dir.display(),
                success = report.success,
                total = report.total,
                "scheduled backup finished"
            ),
            Ok(RunOutcome::Empty) => debug!("scheduled backup skipped (empty catalog)"),
            Ok(RunOutcome::Busy) => debug!("scheduled backup skipped (run in progress)"),
            Err(e) => error!(error = %e, "scheduled backup failed"),
        }
    }
}
