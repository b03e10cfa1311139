mod api;
mod db;
mod events;
mod scheduler;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Datelike, Duration as ChronoDuration, Local, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::{broadcast, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{self, ProgressReporter, SyncEvent, SyncMode, SyncOutcome, SyncRequest};
use crate::error::SyncError;
use crate::process;
use crate::remote::{self, SshEndpoint};
use crate::secret::{self, SecretBox};

use events::{emit_task_progress, emit_task_update};
use scheduler::{
    load_schedules, restart_task_scheduler, run_sync_task, spawn_trash_sweep,
    start_task_scheduler, stop_task_scheduler,
};

#[derive(Clone)]
struct Db {
    path: PathBuf,
}

struct AppState {
    db: Db,
    cfg: EngineConfig,
    secrets: SecretBox,
    scheduler: JobScheduler,
    scheduled_jobs: Mutex<HashMap<i64, Uuid>>,
    ws_tx: broadcast::Sender<String>,
    system: Mutex<System>,
}

#[derive(Debug, Serialize, Clone)]
struct TaskRecord {
    id: i64,
    name: String,
    remote_host: String,
    remote_port: u16,
    username: String,
    #[serde(skip_serializing)]
    password: String,
    local_dir: String,
    remote_dir: String,
    interval_minutes: i64,
    version_enabled: bool,
    trash_enabled: bool,
    enabled: bool,
    is_running: bool,
    started_at: Option<i64>,
    consecutive_failures: i64,
    last_sync_time: Option<String>,
    last_sync_status: Option<String>,
    created_at: String,
    updated_at: String,
}

const TASK_COLUMNS: &str = "id,name,remote_host,remote_port,username,password,local_dir,remote_dir,\
     interval_minutes,version_enabled,trash_enabled,enabled,is_running,started_at,\
     consecutive_failures,last_sync_time,last_sync_status,created_at,updated_at";

impl TaskRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            remote_host: row.get(2)?,
            remote_port: row.get::<_, i64>(3)? as u16,
            username: row.get(4)?,
            password: row.get(5)?,
            local_dir: row.get(6)?,
            remote_dir: row.get(7)?,
            interval_minutes: row.get(8)?,
            version_enabled: i64_to_bool(row.get(9)?),
            trash_enabled: i64_to_bool(row.get(10)?),
            enabled: i64_to_bool(row.get(11)?),
            is_running: i64_to_bool(row.get(12)?),
            started_at: row.get(13)?,
            consecutive_failures: row.get(14)?,
            last_sync_time: row.get(15)?,
            last_sync_status: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    fn endpoint(&self) -> SshEndpoint {
        SshEndpoint {
            host: self.remote_host.clone(),
            port: self.remote_port,
            username: self.username.clone(),
        }
    }
}

/// Listing shape for observers: the record plus a derived status so the
/// outer surface never joins against logs itself.
#[derive(Debug, Serialize)]
struct TaskListItem {
    #[serde(flatten)]
    task: TaskRecord,
    status: String,
}

impl TaskListItem {
    fn derive(task: TaskRecord) -> Self {
        let status = if task.is_running {
            "running".to_string()
        } else {
            task.last_sync_status
                .clone()
                .unwrap_or_else(|| "idle".to_string())
        };
        Self { task, status }
    }
}

/// Create/update payload. `password` arrives as plaintext from the outer
/// surface and is re-written to ciphertext before it reaches the store.
#[derive(Debug, Deserialize)]
struct TaskRequest {
    name: String,
    remote_host: String,
    #[serde(default = "default_port")]
    remote_port: u16,
    username: String,
    #[serde(default)]
    password: String,
    local_dir: String,
    remote_dir: String,
    interval_minutes: i64,
    #[serde(default)]
    version_enabled: bool,
    #[serde(default)]
    trash_enabled: bool,
    #[serde(default = "default_true")]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct TestConnectionRequest {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
struct LogRecord {
    id: i64,
    task_id: i64,
    timestamp: String,
    status: String,
    output: String,
    duration_s: f64,
    sync_mode: String,
}

impl LogRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            timestamp: row.get(2)?,
            status: row.get(3)?,
            output: row.get(4)?,
            duration_s: row.get(5)?,
            sync_mode: row.get(6)?,
        })
    }
}

/// Result of one lock acquisition attempt. `locked == false` means another
/// run holds the task; the snapshot still describes the current row.
#[derive(Debug)]
struct LockAttempt {
    task: TaskRecord,
    locked: bool,
}

struct RunCompletion {
    consecutive_failures: i64,
    auto_disabled: bool,
}

struct DashboardCounters {
    running_tasks: i64,
    runs_today: i64,
    failures_today: i64,
}

#[derive(Debug, Serialize)]
struct DashboardResponse {
    running_tasks: i64,
    runs_today: i64,
    failures_today: i64,
    cpu_usage_percent: f32,
    memory_used_bytes: u64,
    memory_total_bytes: u64,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(value: SyncError) -> Self {
        let status = match &value {
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::AlreadyRunning(_) => StatusCode::CONFLICT,
            SyncError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: value.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        let status = match value.downcast_ref::<SyncError>() {
            Some(SyncError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(SyncError::AlreadyRunning(_)) => StatusCode::CONFLICT,
            Some(SyncError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            None => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: value.to_string(),
        }
    }
}

pub async fn run_server(
    host: String,
    port: u16,
    db_path: PathBuf,
    cfg: EngineConfig,
    secrets: SecretBox,
) -> Result<()> {
    let db = Db::new(db_path);
    db.init().await?;
    let rewritten = db.migrate_passwords(&secrets).await?;
    if rewritten > 0 {
        info!(rewritten, "re-encrypted stored plaintext passwords");
    }

    let scheduler = JobScheduler::new()
        .await
        .context("create scheduler failed")?;
    let (ws_tx, _) = broadcast::channel(1024);

    let state = Arc::new(AppState {
        db,
        cfg,
        secrets,
        scheduler,
        scheduled_jobs: Mutex::new(HashMap::new()),
        ws_tx,
        system: Mutex::new(System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        )),
    });

    load_schedules(state.clone()).await?;
    state
        .scheduler
        .start()
        .await
        .context("failed to start scheduler")?;
    spawn_trash_sweep(state.clone());

    let app = Router::new()
        .route("/api/health", get(api::api_health))
        .route("/api/tasks", get(api::api_list_tasks).post(api::api_create_task))
        .route(
            "/api/tasks/:id",
            get(api::api_get_task)
                .put(api::api_update_task)
                .delete(api::api_delete_task),
        )
        .route("/api/tasks/:id/toggle", post(api::api_toggle_task))
        .route("/api/tasks/:id/sync", post(api::api_sync_task))
        .route("/api/tasks/:id/logs", get(api::api_get_logs))
        .route("/api/test-connection", post(api::api_test_connection))
        .route("/api/dashboard", get(api::api_dashboard))
        .route("/ws", get(api::ws_handler))
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address: {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("management api listening on http://{}", addr);
    axum::serve(listener, app)
        .await
        .context("management api failed")?;
    Ok(())
}

/// One manual run without the HTTP surface, for the CLI. Goes through the
/// same lock/record path as scheduled runs.
pub async fn run_task_once(
    db_path: PathBuf,
    cfg: EngineConfig,
    secrets: SecretBox,
    task_id: i64,
    reporter: Option<ProgressReporter>,
) -> Result<SyncOutcome> {
    let db = Db::new(db_path);
    db.init().await?;
    db.migrate_passwords(&secrets).await?;

    let scheduler = JobScheduler::new()
        .await
        .context("create scheduler failed")?;
    let (ws_tx, _) = broadcast::channel(16);
    let state = Arc::new(AppState {
        db,
        cfg,
        secrets,
        scheduler,
        scheduled_jobs: Mutex::new(HashMap::new()),
        ws_tx,
        system: Mutex::new(System::new()),
    });
    run_sync_task(state, task_id, "manual", reporter).await
}

fn bool_to_i64(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

fn i64_to_bool(value: i64) -> bool {
    value != 0
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    22
}
