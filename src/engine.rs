use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::EngineConfig;
use crate::process::{self, run, OutputHook, RunOptions, RunOutput};
use crate::remote::{self, SshEndpoint};

/// rsync's "some source files vanished" partial code; the mirror is still
/// consistent for everything that existed, so it counts as success.
pub const RSYNC_VANISHED_FILES: i32 = 24;

const TRASH_MOVE_BATCH: usize = 100;
const SFTP_FALLBACK_WARNING: &str =
    "warning: rsync failed, resynced with sftp (remote deletions and versioning were skipped)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Rsync,
    Sftp,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Rsync => "rsync",
            SyncMode::Sftp => "sftp",
        }
    }
}

/// Everything one run needs, resolved up front. The password is plaintext
/// here; the caller scrubs it as soon as the run returns.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub task_id: i64,
    pub local_dir: PathBuf,
    pub remote_dir: String,
    pub endpoint: SshEndpoint,
    pub password: String,
    pub version_enabled: bool,
    pub trash_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: bool,
    pub output: String,
    pub mode: SyncMode,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Progress { percent: u8, speed: String },
}

pub type ProgressReporter = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// One sync run: remote preparation, trash pre-pass, rsync, sftp fallback,
/// version retention. Always resolves to an outcome; the caller persists it
/// and releases the task lock regardless of which leg failed.
pub async fn run_sync(
    cfg: &EngineConfig,
    req: &SyncRequest,
    reporter: Option<ProgressReporter>,
) -> SyncOutcome {
    let stamp = run_timestamp();

    if let Err(output) = prepare_remote_dirs(cfg, req).await {
        return SyncOutcome {
            success: false,
            output,
            mode: SyncMode::Rsync,
        };
    }

    if req.trash_enabled {
        // A partially applied trash pass must not be followed by a deleting
        // transfer, so any batch failure aborts the run here.
        if let Err(output) = move_extras_to_trash(cfg, req, &stamp).await {
            return SyncOutcome {
                success: false,
                output,
                mode: SyncMode::Rsync,
            };
        }
    }

    let primary = run_rsync(cfg, req, &stamp, reporter).await;
    if primary.code == 0 || primary.code == RSYNC_VANISHED_FILES {
        if req.version_enabled {
            cleanup_versions(cfg, req).await;
        }
        return SyncOutcome {
            success: true,
            output: primary.combined(cfg.max_output_size),
            mode: SyncMode::Rsync,
        };
    }

    warn!(
        task_id = req.task_id,
        code = primary.code,
        "rsync failed, falling back to sftp"
    );
    let fallback = run_sftp(cfg, req).await;
    let mut detail = primary.combined(cfg.max_output_size);
    detail.push('\n');
    detail.push_str(&fallback.combined(cfg.max_output_size));
    // The warning line must survive truncation, so the cap applies to the
    // tool output underneath it.
    let room = cfg
        .max_output_size
        .saturating_sub(SFTP_FALLBACK_WARNING.len() + 1);
    let output = format!(
        "{SFTP_FALLBACK_WARNING}\n{}",
        process::truncate_tail(detail, room)
    );
    SyncOutcome {
        success: fallback.success(),
        output,
        mode: SyncMode::Sftp,
    }
}

async fn prepare_remote_dirs(cfg: &EngineConfig, req: &SyncRequest) -> Result<(), String> {
    let command = prepare_command(cfg, remote_base(req));
    let output =
        remote::run_remote(&req.endpoint, &req.password, &command, cfg.ssh_mkdir_timeout).await;
    if output.success() {
        Ok(())
    } else {
        Err(prefixed("remote directory preparation failed", output, cfg))
    }
}

pub(crate) fn prepare_command(cfg: &EngineConfig, base: &str) -> String {
    format!(
        "mkdir -p {} {} {}",
        process::shell_escape(base),
        process::shell_escape(&format!("{base}/{}", cfg.versions_dir)),
        process::shell_escape(&format!("{base}/{}", cfg.trash_dir)),
    )
}

async fn move_extras_to_trash(
    cfg: &EngineConfig,
    req: &SyncRequest,
    stamp: &str,
) -> Result<(), String> {
    // The walk can cover a large tree; keep it off the async workers like
    // the store does with its SQLite calls.
    let local_dir = req.local_dir.clone();
    let local = tokio::task::spawn_blocking(move || collect_local_files(&local_dir))
        .await
        .map_err(|err| format!("local directory walk failed: {err}"))?;
    let remote = collect_remote_files(cfg, req).await?;
    let extras: Vec<String> = remote.difference(&local).cloned().collect();
    if extras.is_empty() {
        return Ok(());
    }

    let base = remote_base(req);
    info!(
        task_id = req.task_id,
        extras = extras.len(),
        "moving remote-only files to trash"
    );
    let trash_root = format!("{base}/{}/{stamp}", cfg.trash_dir);
    for command in trash_move_commands(base, &trash_root, &extras) {
        let output = remote::run_remote(
            &req.endpoint,
            &req.password,
            &command,
            cfg.ssh_trash_move_timeout,
        )
        .await;
        if !output.success() {
            return Err(prefixed("moving deleted files to trash failed", output, cfg));
        }
    }
    Ok(())
}

/// Recursive walk of the local tree as POSIX-relative paths. Unreadable
/// entries are skipped with a warning, not treated as run failures.
pub(crate) fn collect_local_files(local_dir: &Path) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(local_dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(local_dir) {
            files.insert(posix_rel_path(rel));
        }
    }
    files
}

pub(crate) fn posix_rel_path(rel: &Path) -> String {
    rel.components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn collect_remote_files(
    cfg: &EngineConfig,
    req: &SyncRequest,
) -> Result<BTreeSet<String>, String> {
    let command = find_command(cfg, remote_base(req));
    let output =
        remote::run_remote(&req.endpoint, &req.password, &command, cfg.ssh_find_timeout).await;
    if !output.success() {
        return Err(prefixed("listing remote files failed", output, cfg));
    }
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub(crate) fn find_command(cfg: &EngineConfig, base: &str) -> String {
    format!(
        "cd {} && find . -type f ! -path {} ! -path {} | sed 's|^\\./||'",
        process::shell_escape(base),
        process::shell_escape(&format!("./{}/*", cfg.versions_dir)),
        process::shell_escape(&format!("./{}/*", cfg.trash_dir)),
    )
}

/// `mkdir && mv` pairs for every remote-only file, joined into batches so a
/// large backlog does not turn into thousands of ssh round-trips.
pub(crate) fn trash_move_commands(base: &str, trash_root: &str, extras: &[String]) -> Vec<String> {
    extras
        .chunks(TRASH_MOVE_BATCH)
        .map(|chunk| {
            chunk
                .iter()
                .map(|rel| {
                    let parent = match rel.rsplit_once('/') {
                        Some((dir, _)) => format!("{trash_root}/{dir}"),
                        None => trash_root.to_string(),
                    };
                    format!(
                        "mkdir -p {} && mv {} {}",
                        process::shell_escape(&parent),
                        process::shell_escape(&format!("{base}/{rel}")),
                        process::shell_escape(&format!("{trash_root}/{rel}")),
                    )
                })
                .collect::<Vec<_>>()
                .join(" && ")
        })
        .collect()
}

pub(crate) fn rsync_args(cfg: &EngineConfig, req: &SyncRequest, stamp: &str) -> Vec<String> {
    let base = remote_base(req);
    let mut args = vec![
        "-avz".to_string(),
        "--delete".to_string(),
        "--force".to_string(),
        format!("--exclude={}", cfg.versions_dir),
        format!("--exclude={}", cfg.trash_dir),
        "--progress".to_string(),
    ];
    if req.version_enabled {
        args.push("--backup".to_string());
        args.push(format!("--backup-dir={base}/{}/{stamp}", cfg.versions_dir));
    }
    args.push("-e".to_string());
    args.push(remote::ssh_transport(req.endpoint.port));

    let local = process::normalize_local_path(&req.local_dir.to_string_lossy());
    // Trailing slash: the contents of local_dir replace the contents of
    // remote_dir, not a nested copy.
    args.push(format!("{}/", local.trim_end_matches('/')));
    args.push(format!("{}:{base}/", req.endpoint.user_at_host()));
    args
}

async fn run_rsync(
    cfg: &EngineConfig,
    req: &SyncRequest,
    stamp: &str,
    reporter: Option<ProgressReporter>,
) -> RunOutput {
    let mut args = vec!["-e".to_string(), "rsync".to_string()];
    args.extend(rsync_args(cfg, req, stamp));

    let on_stdout: Option<OutputHook> = reporter.map(|reporter| {
        Arc::new(move |chunk: &str| {
            if let Some((percent, speed)) = parse_progress(chunk) {
                reporter(SyncEvent::Progress { percent, speed });
            }
        }) as OutputHook
    });

    let opts = RunOptions {
        env: vec![("SSHPASS".to_string(), req.password.clone())],
        timeout: cfg.rsync_timeout,
        on_stdout,
    };
    run("sshpass", &args, opts).await
}

async fn run_sftp(cfg: &EngineConfig, req: &SyncRequest) -> RunOutput {
    let base = remote_base(req);
    let local = process::normalize_local_path(&req.local_dir.to_string_lossy());
    let local_root = local.trim_end_matches('/').to_string();
    let base_owned = base.to_string();
    let staged =
        tokio::task::spawn_blocking(move || write_sftp_batch(&local_root, &base_owned)).await;
    let batch = match staged {
        Ok(Ok(batch)) => batch,
        Ok(Err(err)) => {
            return RunOutput::failure(format!("failed to stage sftp batch file: {err}"))
        }
        Err(err) => return RunOutput::failure(format!("failed to stage sftp batch file: {err}")),
    };
    let batch_path = batch.path().to_string_lossy().into_owned();
    let (program, args) = remote::sftp_invocation(&req.endpoint, &batch_path);

    let mut opts = RunOptions::with_timeout(cfg.sftp_timeout);
    opts.env
        .push(("SSHPASS".to_string(), req.password.clone()));
    run(&program, &args, opts).await
    // `batch` drops here and removes the staged file.
}

fn write_sftp_batch(local: &str, remote: &str) -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "put -r {local}/* {remote}/")?;
    file.flush()?;
    Ok(file)
}

async fn cleanup_versions(cfg: &EngineConfig, req: &SyncRequest) {
    let command = version_cleanup_command(cfg, remote_base(req));
    let output = remote::run_remote(
        &req.endpoint,
        &req.password,
        &command,
        cfg.ssh_version_cleanup_timeout,
    )
    .await;
    if !output.success() {
        // Retention is advisory; the transfer itself already succeeded.
        warn!(
            task_id = req.task_id,
            "version cleanup failed: {}",
            output.combined(cfg.max_output_size)
        );
    }
}

pub(crate) fn version_cleanup_command(cfg: &EngineConfig, base: &str) -> String {
    format!(
        "cd {} && ls -td */ | tail -n +{} | while read d; do rm -rf \"$d\"; done",
        process::shell_escape(&format!("{base}/{}", cfg.versions_dir)),
        cfg.max_versions + 1,
    )
}

fn remote_base(req: &SyncRequest) -> &str {
    let trimmed = req.remote_dir.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn prefixed(label: &str, output: RunOutput, cfg: &EngineConfig) -> String {
    let detail = output.combined(cfg.max_output_size);
    if detail.trim().is_empty() {
        label.to_string()
    } else {
        format!("{label}\n{detail}")
    }
}

static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,3})%\s+([0-9.]+\w+/s)").expect("progress regex"));

pub(crate) fn parse_progress(chunk: &str) -> Option<(u8, String)> {
    let caps = PROGRESS_RE.captures(chunk)?;
    let percent: u8 = caps[1].parse().ok()?;
    Some((percent.min(100), caps[2].to_string()))
}

static LAST_STAMP: Lazy<Mutex<(String, u32)>> = Lazy::new(|| Mutex::new((String::new(), 0)));

/// Second-resolution UTC stamp shared by `.versions/<ts>` and `.trash/<ts>`
/// within one run. Runs landing in the same second get a sequence suffix.
pub(crate) fn run_timestamp() -> String {
    let base = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let mut last = LAST_STAMP.lock().unwrap_or_else(|err| err.into_inner());
    if last.0 == base {
        last.1 += 1;
        format!("{base}-{}", last.1 + 1)
    } else {
        *last = (base.clone(), 0);
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn request(version_enabled: bool, trash_enabled: bool) -> SyncRequest {
        SyncRequest {
            task_id: 1,
            local_dir: PathBuf::from("/home/me/photos"),
            remote_dir: "/srv/backup/photos/".to_string(),
            endpoint: SshEndpoint {
                host: "backup.example.net".to_string(),
                port: 22,
                username: "deploy".to_string(),
            },
            password: "hunter2".to_string(),
            version_enabled,
            trash_enabled,
        }
    }

    #[test]
    fn timestamps_are_sortable_and_unique() {
        let re = Regex::new(r"^\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}(-\d+)?$").unwrap();
        let a = run_timestamp();
        let b = run_timestamp();
        assert!(re.is_match(&a), "unexpected stamp: {a}");
        assert!(re.is_match(&b), "unexpected stamp: {b}");
        assert_ne!(a, b);
    }

    #[test]
    fn prepare_creates_all_three_directories() {
        let cfg = EngineConfig::default();
        let command = prepare_command(&cfg, "/srv/my backup");
        assert_eq!(
            command,
            "mkdir -p '/srv/my backup' '/srv/my backup/.versions' '/srv/my backup/.trash'"
        );
    }

    #[test]
    fn find_excludes_history_directories() {
        let cfg = EngineConfig::default();
        let command = find_command(&cfg, "/srv/data");
        assert!(command.starts_with("cd '/srv/data' && find . -type f"));
        assert!(command.contains("! -path './.versions/*'"));
        assert!(command.contains("! -path './.trash/*'"));
        assert!(command.ends_with("| sed 's|^\\./||'"));
    }

    #[test]
    fn trash_moves_are_batched_and_escaped() {
        let extras: Vec<String> = (0..250).map(|i| format!("dir {i}/file {i}")).collect();
        let commands = trash_move_commands("/srv/data", "/srv/data/.trash/ts", &extras);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].matches(" && mv ").count(), 100);
        assert_eq!(commands[2].matches(" && mv ").count(), 50);
        assert!(commands[0].contains("mkdir -p '/srv/data/.trash/ts/dir 0'"));
        assert!(commands[0]
            .contains("mv '/srv/data/dir 0/file 0' '/srv/data/.trash/ts/dir 0/file 0'"));
    }

    #[test]
    fn top_level_extras_land_in_the_trash_root() {
        let extras = vec!["a".to_string()];
        let commands = trash_move_commands("/srv/data", "/srv/data/.trash/ts", &extras);
        assert_eq!(
            commands[0],
            "mkdir -p '/srv/data/.trash/ts' && mv '/srv/data/a' '/srv/data/.trash/ts/a'"
        );
    }

    #[test]
    fn rsync_args_without_versioning() {
        let cfg = EngineConfig::default();
        let args = rsync_args(&cfg, &request(false, true), "ts");
        assert_eq!(args[0], "-avz");
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--force".to_string()));
        assert!(args.contains(&"--exclude=.versions".to_string()));
        assert!(args.contains(&"--exclude=.trash".to_string()));
        assert!(args.contains(&"--progress".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--backup")));
        assert_eq!(args[args.len() - 2], "/home/me/photos/");
        assert_eq!(
            args[args.len() - 1],
            "deploy@backup.example.net:/srv/backup/photos/"
        );
    }

    #[test]
    fn rsync_args_with_versioning() {
        let cfg = EngineConfig::default();
        let args = rsync_args(&cfg, &request(true, false), "2031-01-02_03-04-05");
        assert!(args.contains(&"--backup".to_string()));
        assert!(args.contains(
            &"--backup-dir=/srv/backup/photos/.versions/2031-01-02_03-04-05".to_string()
        ));
        let transport = args
            .iter()
            .position(|a| a == "-e")
            .map(|i| args[i + 1].clone())
            .unwrap();
        assert_eq!(transport, "ssh -p 22 -o StrictHostKeyChecking=accept-new");
    }

    #[test]
    fn progress_lines_are_parsed() {
        let line = "      1,234,567  45%    1.23MB/s    0:00:12";
        assert_eq!(parse_progress(line), Some((45, "1.23MB/s".to_string())));
        assert_eq!(
            parse_progress("12,345 100%  512.00kB/s 0:00:00 (xfr#3)"),
            Some((100, "512.00kB/s".to_string()))
        );
        assert_eq!(parse_progress("building file list ..."), None);
        assert_eq!(parse_progress("sent 1234 bytes"), None);
    }

    #[test]
    fn local_walk_emits_posix_relative_paths() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), "one").unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("b").join("c"), "two").unwrap();

        let files = collect_local_files(dir.path());
        let expected: BTreeSet<String> = ["a".to_string(), "b/c".to_string()].into();
        assert_eq!(files, expected);
    }

    #[test]
    fn walking_a_missing_dir_is_empty_not_fatal() {
        let files = collect_local_files(Path::new("/definitely/not/a/real/dir"));
        assert!(files.is_empty());
    }

    #[test]
    fn version_cleanup_keeps_the_newest_directories() {
        let cfg = EngineConfig::default();
        let command = version_cleanup_command(&cfg, "/srv/data");
        assert_eq!(
            command,
            "cd '/srv/data/.versions' && ls -td */ | tail -n +11 | while read d; do rm -rf \"$d\"; done"
        );
    }

    #[test]
    fn sftp_batch_uploads_the_whole_tree() {
        let file = write_sftp_batch("/home/me/photos", "/srv/backup/photos").unwrap();
        let body = fs::read_to_string(file.path()).unwrap();
        assert_eq!(body, "put -r /home/me/photos/* /srv/backup/photos/\n");
    }
}
