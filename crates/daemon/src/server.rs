use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use smart_backup_core::{
    CatalogEntry, EngineState, PathCatalog, ProgressSink, RunOutcome, Settings,
};
use smart_backup_storage::{enumerate, latest_log, notify, BackupEngine, SettingsStore};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::scheduler::run_backup;
use crate::sink::StatusBoard;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BackupEngine>,
    pub catalog: Arc<Mutex<PathCatalog>>,
    pub settings: Arc<Mutex<Settings>>,
    pub settings_store: SettingsStore,
    pub board: Arc<StatusBoard>,
    /// Wakes the scheduler so it picks up a new interval.
    pub rearm: Arc<Notify>,
    pub api_token: Option<String>,
}

impl AppState {
    pub fn new(settings_store: SettingsStore, settings: Settings, api_token: Option<String>) -> Self {
        Self {
            engine: Arc::new(BackupEngine::new()),
            catalog: Arc::new(Mutex::new(PathCatalog::new())),
            settings: Arc::new(Mutex::new(settings)),
            settings_store,
            board: Arc::new(StatusBoard::default()),
            rearm: Arc::new(Notify::new()),
            api_token,
        }
    }
}

/// Enumerates `paths` into the catalog. Folders are walked recursively only
/// when both `recursive` and the `include_subfolders` setting are on.
/// Returns how many entries were added.
pub async fn add_paths(state: &AppState, paths: Vec<PathBuf>, recursive: bool) -> Result<usize> {
    let settings = state.settings.lock().await.clone();
    let mut catalog = state.catalog.clone().lock_owned().await;
    let recursive = recursive && settings.include_subfolders;

    tokio::task::spawn_blocking(move || {
        let mut inserted = 0;
        for path in paths {
            let path = absolutize(&path)?;
            inserted += enumerate(&mut catalog, &path, recursive, &settings);
        }
        Ok::<_, anyhow::Error>(inserted)
    })
    .await
    .context("enumeration task failed")?
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("resolve current directory")?;
    Ok(cwd.join(path))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route(
            "/api/v1/catalog",
            get(list_catalog).post(add_to_catalog).delete(clear_catalog),
        )
        .route("/api/v1/catalog/remove", post(remove_from_catalog))
        .route("/api/v1/backups", post(backup_now))
        .route("/api/v1/status", get(status))
        .route("/api/v1/notifications", get(notifications))
        .route("/api/v1/settings", get(get_settings).put(update_settings))
        .route("/api/v1/log/latest", get(latest_run_log))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

fn require_api_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

#[derive(Debug, Serialize)]
struct CatalogResponse {
    count: usize,
    entries: Vec<CatalogEntry>,
}

async fn list_catalog(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CatalogResponse>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let catalog = state.catalog.lock().await;
    Ok(Json(CatalogResponse {
        count: catalog.count(),
        entries: catalog.snapshot(),
    }))
}

#[derive(Debug, Deserialize)]
struct AddRequest {
    paths: Vec<PathBuf>,
    #[serde(default)]
    recursive: bool,
}

async fn add_to_catalog(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AddRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let inserted = add_paths(&state, req.paths, req.recursive)
        .await
        .map_err(|e| {
            warn!(error = %e, "adding paths failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let count = state.catalog.lock().await.count();
    let message = format!("{count} items ready for backup");
    state.board.update(&message, 0.0);
    Ok(Json(serde_json::json!({
        "inserted": inserted,
        "count": count,
        "message": message,
    })))
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    path: PathBuf,
}

async fn remove_from_catalog(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RemoveRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let path = absolutize(&req.path).map_err(|e| {
        warn!(error = %e, "resolving path to remove failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let mut catalog = state.catalog.lock().await;
    if !catalog.remove(&path) {
        return Err(StatusCode::NOT_FOUND);
    }

    let count = catalog.count();
    let message = format!("{count} items remaining");
    state.board.update(&message, 0.0);
    Ok(Json(serde_json::json!({ "count": count, "message": message })))
}

async fn clear_catalog(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    state.catalog.lock().await.clear();
    state.board.update("List cleared", 0.0);
    Ok(Json(serde_json::json!({ "count": 0 })))
}

async fn backup_now(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(status) = require_api_auth(&state, &headers) {
        return status.into_response();
    }

    match run_backup(&state).await {
        Ok(RunOutcome::Completed(report)) => {
            Json(serde_json::json!({ "status": "completed", "report": report })).into_response()
        }
        Ok(RunOutcome::Empty) => Json(serde_json::json!({
            "status": "empty",
            "message": "No items to backup",
        }))
        .into_response(),
        Ok(RunOutcome::Busy) => {
            let settings = state.settings.lock().await.clone();
            notify(&settings, &*state.board, "Busy", "Backup already in progress");
            error_response(StatusCode::CONFLICT, "Backup already in progress")
        }
        Err(e) => {
            warn!(error = %e, "manual backup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    message: String,
    fraction: f64,
    state: EngineState,
    catalog_count: usize,
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let snapshot = state.board.status();
    Ok(Json(StatusResponse {
        message: snapshot.message,
        fraction: snapshot.fraction,
        state: state.engine.state(),
        catalog_count: state.catalog.lock().await.count(),
    }))
}

async fn notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::sink::Notice>>, StatusCode> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.board.notices()))
}

async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Settings>, StatusCode> {
    require_api_auth(&state, &headers)?;
    Ok(Json(state.settings.lock().await.clone()))
}

async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(updated): Json<Settings>,
) -> Response {
    if let Err(status) = require_api_auth(&state, &headers) {
        return status.into_response();
    }
    if let Err(e) = updated.validate() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }
    if let Err(e) = state.settings_store.save(&updated) {
        warn!(error = %e, "saving settings failed");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    if let Err(e) = std::fs::create_dir_all(&updated.destination) {
        warn!(destination = %updated.destination.display(), error = %e, "could not create backup destination");
    }

    info!(
        destination = %updated.destination.display(),
        auto_backup = updated.auto_backup,
        interval_secs = updated.interval_secs,
        "settings updated"
    );
    *state.settings.lock().await = updated.clone();
    state.rearm.notify_one();
    Json(updated).into_response()
}

async fn latest_run_log(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    require_api_auth(&state, &headers)?;
    let destination = state.settings.lock().await.destination.clone();
    let found = tokio::task::spawn_blocking(move || latest_log(&destination))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map_err(|e| {
            warn!(error = %e, "reading latest run log failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    match found {
        Some((path, contents)) => Ok(Json(serde_json::json!({
            "path": path,
            "contents": contents,
        }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}
