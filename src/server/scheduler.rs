use super::*;

pub(super) async fn load_schedules(state: Arc<AppState>) -> Result<()> {
    let tasks = state.db.list_enabled_tasks().await?;
    for task in tasks {
        start_task_scheduler(state.clone(), &task).await?;
    }
    Ok(())
}

/// Starts the periodic timer for one task. Idempotent: an existing timer for
/// the id is left untouched, so repeated calls never double-schedule.
pub(super) async fn start_task_scheduler(state: Arc<AppState>, task: &TaskRecord) -> Result<()> {
    if !task.enabled {
        return Ok(());
    }

    let interval = StdDuration::from_secs(task.interval_minutes.max(1) as u64 * 60);
    let task_id = task.id;
    let state_for_job = state.clone();
    let job = Job::new_repeated_async(interval, move |_id, _lock| {
        let state_for_tick = state_for_job.clone();
        Box::pin(async move {
            tick(state_for_tick, task_id).await;
        })
    })
    .with_context(|| format!("failed to build timer for task {task_id}"))?;
    let job_id = job.guid();

    // Reserve the map slot before the scheduler call so the guard is never
    // held across an await; a losing concurrent start bails out here.
    {
        let mut jobs = state.scheduled_jobs.lock().await;
        if jobs.contains_key(&task_id) {
            return Ok(());
        }
        jobs.insert(task_id, job_id);
    }
    if let Err(err) = state.scheduler.add(job).await {
        state.scheduled_jobs.lock().await.remove(&task_id);
        return Err(err)
            .with_context(|| format!("failed adding scheduler job for task {task_id}"));
    }
    info!(
        task_id,
        interval_minutes = task.interval_minutes,
        "task scheduled"
    );
    Ok(())
}

pub(super) async fn stop_task_scheduler(state: Arc<AppState>, task_id: i64) {
    if let Some(job_id) = state.scheduled_jobs.lock().await.remove(&task_id) {
        if let Err(err) = state.scheduler.remove(&job_id).await {
            warn!(task_id, error = %err, "failed to remove scheduler job");
        }
    }
}

pub(super) async fn restart_task_scheduler(state: Arc<AppState>, task_id: i64) -> Result<()> {
    stop_task_scheduler(state.clone(), task_id).await;
    if let Some(task) = state.db.get_task(task_id).await? {
        start_task_scheduler(state, &task).await?;
    }
    Ok(())
}

/// One timer firing. Re-reads the task so the timer map never carries task
/// state of its own.
async fn tick(state: Arc<AppState>, task_id: i64) {
    let task = match state.db.get_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            stop_task_scheduler(state, task_id).await;
            return;
        }
        Err(err) => {
            error!(task_id, error = %err, "tick failed to read task");
            return;
        }
    };
    if !task.enabled {
        stop_task_scheduler(state, task_id).await;
        return;
    }
    if task.is_running {
        if is_stale(&task, state.cfg.stale_threshold) {
            warn!(task_id, "clearing stale run lock from a crashed run");
            if let Err(err) = state.db.release_lock(task_id).await {
                error!(task_id, error = %err, "failed to clear stale lock");
                return;
            }
            emit_task_update(&state.ws_tx);
        } else {
            // A run is still in flight; skip this tick entirely.
            return;
        }
    }
    if let Err(err) = run_sync_task(state, task_id, "schedule", None).await {
        error!(task_id, error = %err, "scheduled run failed");
    }
}

pub(super) fn is_stale(task: &TaskRecord, threshold: StdDuration) -> bool {
    match task.started_at {
        Some(started) => Utc::now().timestamp() - started > threshold.as_secs() as i64,
        None => true,
    }
}

/// One complete run for one task: lock, decrypt, transfer, record, emit.
/// The run result is always persisted; if even that fails, the lock is
/// released explicitly so the task does not wedge until the stale threshold.
pub(super) async fn run_sync_task(
    state: Arc<AppState>,
    task_id: i64,
    trigger: &'static str,
    reporter: Option<ProgressReporter>,
) -> Result<SyncOutcome> {
    let lock = state
        .db
        .acquire_lock(task_id, state.cfg.stale_threshold)
        .await?;
    if !lock.locked {
        return Err(SyncError::AlreadyRunning(task_id).into());
    }
    let task = lock.task;
    info!(task_id, trigger, "sync run started");
    emit_task_update(&state.ws_tx);

    let started = Instant::now();
    let outcome = match decrypt_password(&state.secrets, &task) {
        Err(err) => {
            warn!(task_id, error = %err, "cannot run task, stored password is unreadable");
            SyncOutcome {
                success: false,
                output: "failed to decrypt stored password".to_string(),
                mode: SyncMode::Rsync,
            }
        }
        Ok(password) => {
            let mut request = SyncRequest {
                task_id,
                local_dir: PathBuf::from(&task.local_dir),
                remote_dir: task.remote_dir.clone(),
                endpoint: task.endpoint(),
                password,
                version_enabled: task.version_enabled,
                trash_enabled: task.trash_enabled,
            };

            let ws_tx = state.ws_tx.clone();
            let extra = reporter.clone();
            let bridge: ProgressReporter = Arc::new(move |event: SyncEvent| {
                let SyncEvent::Progress { percent, speed } = &event;
                emit_task_progress(&ws_tx, task_id, *percent, speed);
                if let Some(extra) = &extra {
                    extra(event);
                }
            });

            let outcome = engine::run_sync(&state.cfg, &request, Some(bridge)).await;
            secret::scrub(&mut request.password);
            outcome
        }
    };

    let duration_s = started.elapsed().as_secs_f64();
    let recorded = state
        .db
        .record_run(
            task_id,
            outcome.success,
            outcome.output.clone(),
            duration_s,
            outcome.mode.as_str(),
            state.cfg.max_logs,
            state.cfg.max_consecutive_failures,
        )
        .await;
    match recorded {
        Ok(completion) => {
            if completion.auto_disabled {
                warn!(
                    task_id,
                    failures = completion.consecutive_failures,
                    "task disabled after repeated failures"
                );
            }
            if outcome.success {
                info!(task_id, mode = outcome.mode.as_str(), "sync run finished");
            } else {
                warn!(task_id, mode = outcome.mode.as_str(), "sync run failed");
            }
        }
        Err(err) => {
            error!(task_id, error = %err, "failed to persist run result");
            let _ = state.db.release_lock(task_id).await;
        }
    }
    emit_task_update(&state.ws_tx);
    Ok(outcome)
}

fn decrypt_password(secrets: &SecretBox, task: &TaskRecord) -> Result<String> {
    if task.password.is_empty() {
        return Ok(String::new());
    }
    secrets.decrypt(&task.password)
}

/// Retention sweep for `.trash/<ts>` directories, once a day starting at the
/// next local midnight. Failures are logged and never affect run state.
pub(super) fn spawn_trash_sweep(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            let wait = until_next_local_midnight().unwrap_or_else(|err| {
                error!(error = %err, "failed to compute next sweep time");
                StdDuration::from_secs(24 * 3600)
            });
            tokio::time::sleep(wait).await;
            if let Err(err) = sweep_trash(&state).await {
                warn!(error = %err, "trash retention sweep failed");
            }
        }
    });
}

fn until_next_local_midnight() -> Result<StdDuration> {
    let now = Local::now();
    let today = Local
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .ok_or_else(|| anyhow!("failed to construct local day start"))?;
    let next = today + ChronoDuration::days(1);
    Ok((next - now)
        .to_std()
        .unwrap_or(StdDuration::from_secs(1)))
}

async fn sweep_trash(state: &Arc<AppState>) -> Result<()> {
    let tasks = state.db.list_tasks().await?;
    for task in tasks.into_iter().filter(|task| task.trash_enabled) {
        let mut password = match decrypt_password(&state.secrets, &task) {
            Ok(password) => password,
            Err(err) => {
                warn!(task_id = task.id, error = %err, "skipping sweep, stored password is unreadable");
                continue;
            }
        };
        let base = task.remote_dir.trim_end_matches('/');
        let command = format!(
            "find {} -mindepth 1 -maxdepth 1 -type d -mtime +{} -exec rm -rf {{}} \\;",
            process::shell_escape(&format!("{base}/{}", state.cfg.trash_dir)),
            state.cfg.trash_retention_days,
        );
        let output = remote::run_remote(
            &task.endpoint(),
            &password,
            &command,
            state.cfg.ssh_trash_cleanup_timeout,
        )
        .await;
        secret::scrub(&mut password);
        if output.success() {
            info!(task_id = task.id, "trash retention sweep done");
        } else {
            warn!(
                task_id = task.id,
                "trash sweep failed: {}",
                output.combined(state.cfg.max_output_size)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_started_at(started_at: Option<i64>) -> TaskRecord {
        TaskRecord {
            id: 1,
            name: "photos".to_string(),
            remote_host: "backup.example.net".to_string(),
            remote_port: 22,
            username: "deploy".to_string(),
            password: String::new(),
            local_dir: "/tmp".to_string(),
            remote_dir: "/srv/backup".to_string(),
            interval_minutes: 15,
            version_enabled: false,
            trash_enabled: false,
            enabled: true,
            is_running: true,
            started_at,
            consecutive_failures: 0,
            last_sync_time: None,
            last_sync_status: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn lock_staleness_follows_the_threshold() {
        let threshold = StdDuration::from_secs(86_400);
        let now = Utc::now().timestamp();
        assert!(!is_stale(&task_with_started_at(Some(now - 60)), threshold));
        assert!(is_stale(
            &task_with_started_at(Some(now - 90_000)),
            threshold
        ));
        // A running task without a start time has no recoverable owner.
        assert!(is_stale(&task_with_started_at(None), threshold));
    }

    #[test]
    fn next_sweep_is_within_a_day() {
        let wait = until_next_local_midnight().unwrap();
        assert!(wait <= StdDuration::from_secs(24 * 3600));
        assert!(wait > StdDuration::ZERO);
    }
}
