use super::*;

pub(super) async fn api_health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "time": Utc::now().to_rfc3339() }))
}

pub(super) async fn api_list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskListItem>>, ApiError> {
    let tasks = state.db.list_tasks().await?;
    Ok(Json(tasks.into_iter().map(TaskListItem::derive).collect()))
}

pub(super) async fn api_get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TaskListItem>, ApiError> {
    let task = state
        .db
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    Ok(Json(TaskListItem::derive(task)))
}

pub(super) async fn api_create_task(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<TaskRequest>,
) -> Result<(StatusCode, Json<TaskListItem>), ApiError> {
    validate_task_request(&mut req)?;
    seal_password(&state, &mut req, None)?;
    let created = state.db.create_task(req).await?;
    start_task_scheduler(state.clone(), &created).await?;
    Ok((StatusCode::CREATED, Json(TaskListItem::derive(created))))
}

pub(super) async fn api_update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(mut req): Json<TaskRequest>,
) -> Result<Json<TaskListItem>, ApiError> {
    validate_task_request(&mut req)?;
    let existing = state
        .db
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    seal_password(&state, &mut req, Some(&existing))?;
    let task = state
        .db
        .update_task(id, req)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    restart_task_scheduler(state.clone(), id).await?;
    Ok(Json(TaskListItem::derive(task)))
}

pub(super) async fn api_delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    stop_task_scheduler(state.clone(), id).await;
    let removed = state.db.delete_task(id).await?;
    if !removed {
        return Err(ApiError::not_found(format!("task {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn api_toggle_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ToggleRequest>,
) -> Result<Json<TaskListItem>, ApiError> {
    let task = state
        .db
        .set_task_enabled(id, req.enabled)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    if req.enabled {
        restart_task_scheduler(state.clone(), id).await?;
    } else {
        stop_task_scheduler(state.clone(), id).await;
    }
    emit_task_update(&state.ws_tx);
    Ok(Json(TaskListItem::derive(task)))
}

/// Synchronous manual run: responds once the run has been recorded.
pub(super) async fn api_sync_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match run_sync_task(state, id, "manual", None).await {
        Ok(outcome) => Json(json!({
            "success": outcome.success,
            "output": outcome.output,
            "sync_mode": outcome.mode.as_str(),
        }))
        .into_response(),
        Err(err) => {
            let status = match err.downcast_ref::<SyncError>() {
                Some(SyncError::NotFound(_)) => StatusCode::NOT_FOUND,
                Some(SyncError::AlreadyRunning(_)) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(json!({ "success": false, "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

pub(super) async fn api_get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    if state.db.get_task(id).await?.is_none() {
        return Err(ApiError::not_found(format!("task {id} not found")));
    }
    Ok(Json(state.db.list_logs(id, state.cfg.max_logs).await?))
}

pub(super) async fn api_test_connection(
    State(state): State<Arc<AppState>>,
    Json(mut req): Json<TestConnectionRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    req.host = req.host.trim().to_string();
    req.username = req.username.trim().to_string();
    if req.host.is_empty() || req.username.is_empty() {
        return Err(ApiError::bad_request("host and username are required"));
    }
    let endpoint = SshEndpoint {
        host: req.host,
        port: req.port,
        username: req.username,
    };
    let result = remote::test_connection(&state.cfg, &endpoint, &req.password).await;
    secret::scrub(&mut req.password);
    Ok(Json(match result {
        Ok(()) => json!({ "success": true }),
        Err(error) => json!({ "success": false, "error": error }),
    }))
}

pub(super) async fn api_dashboard(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DashboardResponse>, ApiError> {
    let counters = state.db.dashboard_counters().await?;
    let (cpu_usage_percent, memory_used_bytes, memory_total_bytes) = {
        let mut sys = state.system.lock().await;
        sys.refresh_cpu();
        sys.refresh_memory();
        (
            sys.global_cpu_info().cpu_usage(),
            sys.used_memory(),
            sys.total_memory(),
        )
    };
    Ok(Json(DashboardResponse {
        running_tasks: counters.running_tasks,
        runs_today: counters.runs_today,
        failures_today: counters.failures_today,
        cpu_usage_percent,
        memory_used_bytes,
        memory_total_bytes,
    }))
}

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_client(socket, state))
}

pub(super) async fn ws_client(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.ws_tx.subscribe();
    while let Ok(payload) = rx.recv().await {
        if socket.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
}

fn validate_task_request(req: &mut TaskRequest) -> Result<(), SyncError> {
    req.name = req.name.trim().to_string();
    req.remote_host = req.remote_host.trim().to_string();
    req.username = req.username.trim().to_string();
    req.local_dir = req.local_dir.trim().to_string();
    req.remote_dir = req.remote_dir.trim().to_string();

    let invalid = |message: &str| Err(SyncError::InvalidInput(message.to_string()));
    if req.name.is_empty() {
        return invalid("name is required");
    }
    if req.remote_host.is_empty() || req.username.is_empty() {
        return invalid("remote host and username are required");
    }
    if req.remote_port == 0 {
        return invalid("remote port must be between 1 and 65535");
    }
    if req.remote_dir.is_empty() {
        return invalid("remote directory is required");
    }
    if req.interval_minutes < 1 {
        return invalid("interval must be at least one minute");
    }
    if req.local_dir.is_empty() || !FsPath::new(&req.local_dir).is_dir() {
        return Err(SyncError::InvalidInput(format!(
            "local directory does not exist: {}",
            req.local_dir
        )));
    }
    Ok(())
}

/// Converts the request's plaintext password to ciphertext. An empty value
/// on update keeps the stored one.
fn seal_password(
    state: &Arc<AppState>,
    req: &mut TaskRequest,
    existing: Option<&TaskRecord>,
) -> Result<(), ApiError> {
    if req.password.is_empty() {
        if let Some(existing) = existing {
            req.password = existing.password.clone();
        }
        return Ok(());
    }
    if secret::looks_encrypted(&req.password) {
        return Ok(());
    }
    let sealed = state
        .secrets
        .encrypt(&req.password)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    secret::scrub(&mut req.password);
    req.password = sealed;
    Ok(())
}
