use super::*;

const LOCK_RETRIES: u32 = 5;

impl Db {
    pub(super) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(super) fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open sqlite db: {}", self.path.display()))?;
        conn.execute_batch(
            "PRAGMA foreign_keys=ON;
             PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )
        .context("failed to initialize sqlite pragmas")?;
        Ok(conn)
    }

    pub(super) async fn init(&self) -> Result<()> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = db.open()?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    remote_host TEXT NOT NULL,
                    remote_port INTEGER NOT NULL DEFAULT 22,
                    username TEXT NOT NULL,
                    password TEXT NOT NULL DEFAULT '',
                    local_dir TEXT NOT NULL,
                    remote_dir TEXT NOT NULL,
                    interval_minutes INTEGER NOT NULL,
                    version_enabled INTEGER NOT NULL DEFAULT 0,
                    trash_enabled INTEGER NOT NULL DEFAULT 0,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    is_running INTEGER NOT NULL DEFAULT 0,
                    started_at INTEGER,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    last_sync_time TEXT,
                    last_sync_status TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL,
                    timestamp TEXT NOT NULL,
                    status TEXT NOT NULL,
                    output TEXT NOT NULL DEFAULT '',
                    duration_s REAL NOT NULL DEFAULT 0,
                    sync_mode TEXT NOT NULL DEFAULT 'rsync',
                    FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
                );
                CREATE INDEX IF NOT EXISTS idx_logs_task_id ON logs(task_id);
                CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp DESC);
                "#,
            )
            .context("failed to init sqlite schema")?;

            // Forward-only upgrades for databases created before these
            // columns existed.
            ensure_column(&conn, "tasks", "is_running", "INTEGER NOT NULL DEFAULT 0")?;
            ensure_column(&conn, "tasks", "started_at", "INTEGER")?;
            ensure_column(
                &conn,
                "tasks",
                "consecutive_failures",
                "INTEGER NOT NULL DEFAULT 0",
            )?;
            ensure_column(&conn, "logs", "sync_mode", "TEXT NOT NULL DEFAULT 'rsync'")?;
            Ok(())
        })
        .await
        .context("sqlite init join error")?
    }

    /// Rewrites any plaintext password rows to ciphertext. Runs at startup
    /// so older databases converge on first use.
    pub(super) async fn migrate_passwords(&self, secrets: &SecretBox) -> Result<usize> {
        let db = self.clone();
        let secrets = secrets.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = db.open()?;
            let mut stmt = conn.prepare("SELECT id,password FROM tasks WHERE password != ''")?;
            let mut rows = stmt.query([])?;
            let mut pending: Vec<(i64, String)> = Vec::new();
            while let Some(row) = rows.next()? {
                let id: i64 = row.get(0)?;
                let password: String = row.get(1)?;
                if !secret::looks_encrypted(&password) {
                    pending.push((id, password));
                }
            }
            drop(rows);
            drop(stmt);

            let rewritten = pending.len();
            for (id, mut password) in pending {
                let ciphertext = secrets.encrypt(&password)?;
                secret::scrub(&mut password);
                conn.execute(
                    "UPDATE tasks SET password=?1 WHERE id=?2",
                    params![ciphertext, id],
                )?;
            }
            Ok(rewritten)
        })
        .await
        .context("password migration join error")?
    }

    pub(super) async fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<TaskRecord>> {
            let conn = db.open()?;
            let mut stmt =
                conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id ASC"))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(TaskRecord::from_row(row)?);
            }
            Ok(out)
        })
        .await
        .context("list tasks join error")?
    }

    pub(super) async fn list_enabled_tasks(&self) -> Result<Vec<TaskRecord>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<TaskRecord>> {
            let conn = db.open()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE enabled=1 ORDER BY id ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(TaskRecord::from_row(row)?);
            }
            Ok(out)
        })
        .await
        .context("list enabled tasks join error")?
    }

    pub(super) async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<TaskRecord>> {
            let conn = db.open()?;
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
                    params![id],
                    TaskRecord::from_row,
                )
                .optional()?;
            Ok(task)
        })
        .await
        .context("get task join error")?
    }

    pub(super) async fn create_task(&self, req: TaskRequest) -> Result<TaskRecord> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<TaskRecord> {
            let conn = db.open()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO tasks (name,remote_host,remote_port,username,password,local_dir,remote_dir,\
                 interval_minutes,version_enabled,trash_enabled,enabled,created_at,updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                params![
                    req.name,
                    req.remote_host,
                    req.remote_port,
                    req.username,
                    req.password,
                    req.local_dir,
                    req.remote_dir,
                    req.interval_minutes,
                    bool_to_i64(req.version_enabled),
                    bool_to_i64(req.trash_enabled),
                    bool_to_i64(req.enabled),
                    now,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
                params![id],
                TaskRecord::from_row,
            )
            .context("read inserted task")
        })
        .await
        .context("create task join error")?
    }

    pub(super) async fn update_task(&self, id: i64, req: TaskRequest) -> Result<Option<TaskRecord>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<TaskRecord>> {
            let conn = db.open()?;
            let now = Utc::now().to_rfc3339();
            let affected = conn.execute(
                "UPDATE tasks SET name=?1,remote_host=?2,remote_port=?3,username=?4,password=?5,\
                 local_dir=?6,remote_dir=?7,interval_minutes=?8,version_enabled=?9,trash_enabled=?10,\
                 enabled=?11,updated_at=?12 WHERE id=?13",
                params![
                    req.name,
                    req.remote_host,
                    req.remote_port,
                    req.username,
                    req.password,
                    req.local_dir,
                    req.remote_dir,
                    req.interval_minutes,
                    bool_to_i64(req.version_enabled),
                    bool_to_i64(req.trash_enabled),
                    bool_to_i64(req.enabled),
                    now,
                    id
                ],
            )?;
            if affected == 0 {
                return Ok(None);
            }
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
                    params![id],
                    TaskRecord::from_row,
                )
                .optional()?;
            Ok(task)
        })
        .await
        .context("update task join error")?
    }

    /// Flipping a task also resets its failure streak so a re-enabled task
    /// starts with a clean slate.
    pub(super) async fn set_task_enabled(
        &self,
        id: i64,
        enabled: bool,
    ) -> Result<Option<TaskRecord>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<TaskRecord>> {
            let conn = db.open()?;
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE tasks SET enabled=?1, consecutive_failures=0, updated_at=?2 WHERE id=?3",
                params![bool_to_i64(enabled), now, id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
                    params![id],
                    TaskRecord::from_row,
                )
                .optional()?;
            Ok(task)
        })
        .await
        .context("set task enabled join error")?
    }

    pub(super) async fn delete_task(&self, id: i64) -> Result<bool> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = db.open()?;
            let affected = conn.execute("DELETE FROM tasks WHERE id=?1", params![id])?;
            Ok(affected > 0)
        })
        .await
        .context("delete task join error")?
    }

    /// Serialized lock acquisition with stale-lock recovery. Retries a few
    /// times on writer contention with linear backoff.
    pub(super) async fn acquire_lock(
        &self,
        id: i64,
        stale_after: StdDuration,
    ) -> Result<LockAttempt> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<LockAttempt> {
            let mut conn = db.open()?;
            let mut attempt = 0;
            loop {
                attempt += 1;
                match try_acquire(&mut conn, id, stale_after) {
                    Ok(outcome) => return Ok(outcome),
                    Err(err) if attempt < LOCK_RETRIES && is_busy(&err) => {
                        std::thread::sleep(StdDuration::from_millis(50 * attempt as u64));
                    }
                    Err(err) => return Err(err),
                }
            }
        })
        .await
        .context("acquire lock join error")?
    }

    pub(super) async fn release_lock(&self, id: i64) -> Result<bool> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let conn = db.open()?;
            let affected = conn.execute(
                "UPDATE tasks SET is_running=0, started_at=NULL WHERE id=?1",
                params![id],
            )?;
            Ok(affected > 0)
        })
        .await
        .context("release lock join error")?
    }

    /// One transaction: log insert, retention trim, lock release and the
    /// failure-accounting update, including the auto-disable flip.
    pub(super) async fn record_run(
        &self,
        id: i64,
        success: bool,
        output: String,
        duration_s: f64,
        mode: &'static str,
        max_logs: usize,
        max_consecutive_failures: i64,
    ) -> Result<RunCompletion> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<RunCompletion> {
            let mut conn = db.open()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now().to_rfc3339();
            let status = if success { "success" } else { "fail" };
            tx.execute(
                "INSERT INTO logs (task_id,timestamp,status,output,duration_s,sync_mode)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![id, now, status, output, duration_s, mode],
            )?;
            tx.execute(
                "DELETE FROM logs WHERE task_id=?1 AND id NOT IN
                 (SELECT id FROM logs WHERE task_id=?1 ORDER BY id DESC LIMIT ?2)",
                params![id, max_logs as i64],
            )?;

            let (prev_failures, enabled): (i64, i64) = tx.query_row(
                "SELECT consecutive_failures, enabled FROM tasks WHERE id=?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let consecutive_failures = if success { 0 } else { prev_failures + 1 };
            let auto_disabled =
                !success && enabled == 1 && consecutive_failures >= max_consecutive_failures;
            let next_enabled = if auto_disabled { 0 } else { enabled };
            tx.execute(
                "UPDATE tasks SET is_running=0, started_at=NULL, last_sync_time=?1,
                 last_sync_status=?2, consecutive_failures=?3, enabled=?4, updated_at=?1
                 WHERE id=?5",
                params![now, status, consecutive_failures, next_enabled, id],
            )?;
            tx.commit()?;
            Ok(RunCompletion {
                consecutive_failures,
                auto_disabled,
            })
        })
        .await
        .context("record run join error")?
    }

    pub(super) async fn list_logs(&self, task_id: i64, limit: usize) -> Result<Vec<LogRecord>> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogRecord>> {
            let conn = db.open()?;
            let mut stmt = conn.prepare(
                "SELECT id,task_id,timestamp,status,output,duration_s,sync_mode
                 FROM logs WHERE task_id=?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(params![task_id, limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(LogRecord::from_row(row)?);
            }
            Ok(out)
        })
        .await
        .context("list logs join error")?
    }

    pub(super) async fn dashboard_counters(&self) -> Result<DashboardCounters> {
        let db = self.clone();
        tokio::task::spawn_blocking(move || -> Result<DashboardCounters> {
            let conn = db.open()?;
            let now_local = Local::now();
            let local_day_start = Local
                .with_ymd_and_hms(now_local.year(), now_local.month(), now_local.day(), 0, 0, 0)
                .single()
                .ok_or_else(|| anyhow!("failed to construct local day start"))?;
            let day_start_utc = local_day_start.with_timezone(&Utc).to_rfc3339();

            let running_tasks: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE is_running=1",
                [],
                |row| row.get(0),
            )?;
            let runs_today: i64 = conn.query_row(
                "SELECT COUNT(*) FROM logs WHERE timestamp >= ?1",
                params![day_start_utc],
                |row| row.get(0),
            )?;
            let failures_today: i64 = conn.query_row(
                "SELECT COUNT(*) FROM logs WHERE timestamp >= ?1 AND status='fail'",
                params![day_start_utc],
                |row| row.get(0),
            )?;
            Ok(DashboardCounters {
                running_tasks,
                runs_today,
                failures_today,
            })
        })
        .await
        .context("dashboard join error")?
    }
}

fn try_acquire(conn: &mut Connection, id: i64, stale_after: StdDuration) -> Result<LockAttempt> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = tx
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
            params![id],
            TaskRecord::from_row,
        )
        .optional()?
        .ok_or(SyncError::NotFound(id))?;

    let now = Utc::now().timestamp();
    if task.is_running {
        // A lock without a start time, or one older than the threshold, is a
        // leftover from a crashed run and may be reclaimed.
        let stale = task
            .started_at
            .map(|started| now - started > stale_after.as_secs() as i64)
            .unwrap_or(true);
        if stale {
            tx.execute(
                "UPDATE tasks SET is_running=0, started_at=NULL WHERE id=?1",
                params![id],
            )?;
        }
    }

    let changed = tx.execute(
        "UPDATE tasks SET is_running=1, started_at=?1 WHERE id=?2 AND is_running=0",
        params![now, id],
    )?;
    let refreshed = tx.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
        params![id],
        TaskRecord::from_row,
    )?;
    tx.commit()?;
    Ok(LockAttempt {
        task: refreshed,
        locked: changed == 1,
    })
}

fn is_busy(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(inner, _))
            if inner.code == rusqlite::ErrorCode::DatabaseBusy
                || inner.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn ensure_column(conn: &Connection, table: &str, column: &str, definition: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(());
        }
    }
    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"),
        [],
    )
    .with_context(|| format!("failed to add column {table}.{column}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_db(dir: &TempDir) -> Db {
        let db = Db::new(dir.path().join("test.db"));
        db.init().await.unwrap();
        db
    }

    fn sample_task() -> TaskRequest {
        TaskRequest {
            name: "photos".to_string(),
            remote_host: "backup.example.net".to_string(),
            remote_port: 22,
            username: "deploy".to_string(),
            password: "v1:YWFh:YmJi".to_string(),
            local_dir: "/tmp".to_string(),
            remote_dir: "/srv/backup/photos".to_string(),
            interval_minutes: 15,
            version_enabled: true,
            trash_enabled: true,
            enabled: true,
        }
    }

    const STALE: StdDuration = StdDuration::from_secs(86_400);

    #[tokio::test]
    async fn create_get_list_delete() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;

        let created = db.create_task(sample_task()).await.unwrap();
        assert_eq!(created.name, "photos");
        assert!(!created.is_running);
        assert_eq!(created.consecutive_failures, 0);

        let fetched = db.get_task(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.remote_dir, "/srv/backup/photos");
        assert_eq!(db.list_tasks().await.unwrap().len(), 1);

        assert!(db.delete_task(created.id).await.unwrap());
        assert!(db.get_task(created.id).await.unwrap().is_none());
        assert!(!db.delete_task(created.id).await.unwrap());
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        db.init().await.unwrap();
        db.create_task(sample_task()).await.unwrap();
        db.init().await.unwrap();
        assert_eq!(db.list_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn password_is_never_serialized() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let task = db.create_task(sample_task()).await.unwrap();
        let value = serde_json::to_value(&task).unwrap();
        assert!(value.get("password").is_none());
    }

    #[tokio::test]
    async fn lock_is_single_flight() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let task = db.create_task(sample_task()).await.unwrap();

        let first = db.acquire_lock(task.id, STALE).await.unwrap();
        assert!(first.locked);
        assert!(first.task.is_running);
        assert!(first.task.started_at.is_some());

        let second = db.acquire_lock(task.id, STALE).await.unwrap();
        assert!(!second.locked);
        assert!(second.task.is_running);

        assert!(db.release_lock(task.id).await.unwrap());
        let third = db.acquire_lock(task.id, STALE).await.unwrap();
        assert!(third.locked);
    }

    #[tokio::test]
    async fn missing_task_is_reported_as_not_found() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let err = db.acquire_lock(404, STALE).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::NotFound(404))
        ));
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let task = db.create_task(sample_task()).await.unwrap();
        assert!(db.acquire_lock(task.id, STALE).await.unwrap().locked);

        // Age the lock past the threshold.
        let old = Utc::now().timestamp() - 90_000;
        db.open()
            .unwrap()
            .execute(
                "UPDATE tasks SET started_at=?1 WHERE id=?2",
                params![old, task.id],
            )
            .unwrap();

        let reclaimed = db.acquire_lock(task.id, STALE).await.unwrap();
        assert!(reclaimed.locked);
    }

    #[tokio::test]
    async fn fresh_lock_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let task = db.create_task(sample_task()).await.unwrap();
        assert!(db.acquire_lock(task.id, STALE).await.unwrap().locked);
        assert!(!db.acquire_lock(task.id, STALE).await.unwrap().locked);
    }

    #[tokio::test]
    async fn failure_accounting_and_auto_disable() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let task = db.create_task(sample_task()).await.unwrap();

        for expected in 1..=2 {
            db.acquire_lock(task.id, STALE).await.unwrap();
            let done = db
                .record_run(task.id, false, "boom".into(), 1.0, "rsync", 100, 3)
                .await
                .unwrap();
            assert_eq!(done.consecutive_failures, expected);
            assert!(!done.auto_disabled);
            let current = db.get_task(task.id).await.unwrap().unwrap();
            assert!(current.enabled);
            assert!(!current.is_running);
            assert_eq!(current.last_sync_status.as_deref(), Some("fail"));
        }

        db.acquire_lock(task.id, STALE).await.unwrap();
        let done = db
            .record_run(task.id, false, "boom".into(), 1.0, "rsync", 100, 3)
            .await
            .unwrap();
        assert_eq!(done.consecutive_failures, 3);
        assert!(done.auto_disabled);
        let current = db.get_task(task.id).await.unwrap().unwrap();
        assert!(!current.enabled);

        // A later success resets the streak.
        db.acquire_lock(task.id, STALE).await.unwrap();
        let done = db
            .record_run(task.id, true, "ok".into(), 1.0, "rsync", 100, 3)
            .await
            .unwrap();
        assert_eq!(done.consecutive_failures, 0);
        assert!(!done.auto_disabled);
        let current = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(current.consecutive_failures, 0);
        assert_eq!(current.last_sync_status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn already_disabled_tasks_do_not_flip_again() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let mut req = sample_task();
        req.enabled = false;
        let task = db.create_task(req).await.unwrap();

        db.acquire_lock(task.id, STALE).await.unwrap();
        for _ in 0..4 {
            let done = db
                .record_run(task.id, false, "boom".into(), 1.0, "rsync", 100, 3)
                .await
                .unwrap();
            assert!(!done.auto_disabled);
            db.acquire_lock(task.id, STALE).await.unwrap();
        }
    }

    #[tokio::test]
    async fn logs_are_trimmed_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let task = db.create_task(sample_task()).await.unwrap();

        for i in 0..8 {
            db.acquire_lock(task.id, STALE).await.unwrap();
            db.record_run(task.id, true, format!("run {i}"), 0.5, "rsync", 5, 3)
                .await
                .unwrap();
        }

        let logs = db.list_logs(task.id, 100).await.unwrap();
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[0].output, "run 7");
        assert_eq!(logs[4].output, "run 3");
        assert!(logs.iter().all(|log| log.sync_mode == "rsync"));
    }

    #[tokio::test]
    async fn deleting_a_task_cascades_logs() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let task = db.create_task(sample_task()).await.unwrap();
        db.acquire_lock(task.id, STALE).await.unwrap();
        db.record_run(task.id, true, "ok".into(), 0.5, "rsync", 100, 3)
            .await
            .unwrap();
        assert!(db.delete_task(task.id).await.unwrap());

        let count: i64 = db
            .open()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM logs WHERE task_id=?1",
                params![task.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn toggling_resets_the_failure_streak() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let task = db.create_task(sample_task()).await.unwrap();
        for _ in 0..3 {
            db.acquire_lock(task.id, STALE).await.unwrap();
            db.record_run(task.id, false, "boom".into(), 1.0, "rsync", 100, 3)
                .await
                .unwrap();
        }
        let toggled = db.set_task_enabled(task.id, true).await.unwrap().unwrap();
        assert!(toggled.enabled);
        assert_eq!(toggled.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn plaintext_passwords_are_rewritten_once() {
        let dir = TempDir::new().unwrap();
        let db = test_db(&dir).await;
        let secrets = SecretBox::new([3u8; 32]);

        let mut req = sample_task();
        req.password = "hunter2".to_string();
        let task = db.create_task(req).await.unwrap();

        assert_eq!(db.migrate_passwords(&secrets).await.unwrap(), 1);
        let migrated = db.get_task(task.id).await.unwrap().unwrap();
        assert!(secret::looks_encrypted(&migrated.password));
        assert_eq!(secrets.decrypt(&migrated.password).unwrap(), "hunter2");

        assert_eq!(db.migrate_passwords(&secrets).await.unwrap(), 0);
    }
}
