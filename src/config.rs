use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Engine tunables. Every field can be overridden through the environment
/// variable of the same name in `from_env`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rsync_timeout: Duration,
    pub sftp_timeout: Duration,
    pub ssh_timeout: Duration,
    pub ssh_mkdir_timeout: Duration,
    pub ssh_find_timeout: Duration,
    pub ssh_trash_move_timeout: Duration,
    pub ssh_version_cleanup_timeout: Duration,
    pub ssh_trash_cleanup_timeout: Duration,
    pub ssh_test_connection_timeout: Duration,
    pub default_command_timeout: Duration,
    pub max_logs: usize,
    pub max_versions: usize,
    pub trash_retention_days: u32,
    pub max_consecutive_failures: i64,
    pub stale_threshold: Duration,
    pub max_output_size: usize,
    pub versions_dir: String,
    pub trash_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rsync_timeout: Duration::from_secs(3600),
            sftp_timeout: Duration::from_secs(300),
            ssh_timeout: Duration::from_secs(120),
            ssh_mkdir_timeout: Duration::from_secs(30),
            ssh_find_timeout: Duration::from_secs(60),
            ssh_trash_move_timeout: Duration::from_secs(120),
            ssh_version_cleanup_timeout: Duration::from_secs(60),
            ssh_trash_cleanup_timeout: Duration::from_secs(120),
            ssh_test_connection_timeout: Duration::from_secs(30),
            default_command_timeout: Duration::from_secs(60),
            max_logs: 100,
            max_versions: 10,
            trash_retention_days: 90,
            max_consecutive_failures: 3,
            stale_threshold: Duration::from_secs(86_400),
            max_output_size: 10_240,
            versions_dir: ".versions".to_string(),
            trash_dir: ".trash".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.rsync_timeout = env_secs("RSYNC_TIMEOUT", cfg.rsync_timeout);
        cfg.sftp_timeout = env_secs("SFTP_TIMEOUT", cfg.sftp_timeout);
        cfg.ssh_timeout = env_secs("SSH_TIMEOUT", cfg.ssh_timeout);
        cfg.ssh_mkdir_timeout = env_secs("SSH_MKDIR_TIMEOUT", cfg.ssh_mkdir_timeout);
        cfg.ssh_find_timeout = env_secs("SSH_FIND_TIMEOUT", cfg.ssh_find_timeout);
        cfg.ssh_trash_move_timeout =
            env_secs("SSH_TRASH_MOVE_TIMEOUT", cfg.ssh_trash_move_timeout);
        cfg.ssh_version_cleanup_timeout =
            env_secs("SSH_VERSION_CLEANUP_TIMEOUT", cfg.ssh_version_cleanup_timeout);
        cfg.ssh_trash_cleanup_timeout =
            env_secs("SSH_TRASH_CLEANUP_TIMEOUT", cfg.ssh_trash_cleanup_timeout);
        cfg.ssh_test_connection_timeout =
            env_secs("SSH_TEST_CONNECTION_TIMEOUT", cfg.ssh_test_connection_timeout);
        cfg.default_command_timeout =
            env_secs("DEFAULT_COMMAND_TIMEOUT", cfg.default_command_timeout);
        cfg.max_logs = env_number("MAX_LOGS", cfg.max_logs);
        cfg.max_versions = env_number("MAX_VERSIONS", cfg.max_versions);
        cfg.trash_retention_days = env_number("TRASH_RETENTION_DAYS", cfg.trash_retention_days);
        cfg.max_consecutive_failures =
            env_number("MAX_CONSECUTIVE_FAILURES", cfg.max_consecutive_failures);
        cfg.stale_threshold = env_secs("STALE_TASK_THRESHOLD", cfg.stale_threshold);
        cfg.max_output_size = env_number("MAX_OUTPUT_SIZE", cfg.max_output_size);
        cfg.versions_dir = env_string("VERSIONS_DIR", &cfg.versions_dir);
        cfg.trash_dir = env_string("TRASH_DIR", &cfg.trash_dir);

        // A stale lock must outlive the longest possible child process, or a
        // live rsync run would be declared crashed and re-entered.
        if cfg.stale_threshold < cfg.rsync_timeout {
            warn!("STALE_TASK_THRESHOLD is below RSYNC_TIMEOUT, raising it to match");
            cfg.stale_threshold = cfg.rsync_timeout;
        }
        cfg
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                warn!(name, value = %raw, "ignoring invalid duration override");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_number<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(name, value = %raw, "ignoring invalid numeric override");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Database file location: `TIDESYNC_DB` override, otherwise the per-user
/// data directory.
pub fn default_db_path() -> Result<PathBuf> {
    if let Ok(explicit) = env::var("TIDESYNC_DB") {
        return Ok(PathBuf::from(explicit));
    }
    Ok(data_dir()?.join("tidesync.db"))
}

pub fn default_key_path() -> Result<PathBuf> {
    if let Ok(explicit) = env::var("TIDESYNC_KEY_FILE") {
        return Ok(PathBuf::from(explicit));
    }
    Ok(data_dir()?.join("secret.key"))
}

fn data_dir() -> Result<PathBuf> {
    let home = env::var("HOME").context("HOME env is not set")?;
    Ok(PathBuf::from(home)
        .join(".local")
        .join("share")
        .join("tidesync"))
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data dir: {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rsync_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.sftp_timeout, Duration::from_secs(300));
        assert_eq!(cfg.max_logs, 100);
        assert_eq!(cfg.max_versions, 10);
        assert_eq!(cfg.trash_retention_days, 90);
        assert_eq!(cfg.max_consecutive_failures, 3);
        assert_eq!(cfg.stale_threshold, Duration::from_secs(86_400));
        assert_eq!(cfg.max_output_size, 10_240);
        assert_eq!(cfg.versions_dir, ".versions");
        assert_eq!(cfg.trash_dir, ".trash");
    }

    #[test]
    fn env_overrides_and_invalid_values() {
        env::set_var("MAX_LOGS", "17");
        env::set_var("SFTP_TIMEOUT", "45");
        env::set_var("MAX_VERSIONS", "not-a-number");
        let cfg = EngineConfig::from_env();
        env::remove_var("MAX_LOGS");
        env::remove_var("SFTP_TIMEOUT");
        env::remove_var("MAX_VERSIONS");

        assert_eq!(cfg.max_logs, 17);
        assert_eq!(cfg.sftp_timeout, Duration::from_secs(45));
        assert_eq!(cfg.max_versions, 10);
    }

    #[test]
    fn stale_threshold_never_undercuts_rsync_timeout() {
        env::set_var("STALE_TASK_THRESHOLD", "10");
        let cfg = EngineConfig::from_env();
        env::remove_var("STALE_TASK_THRESHOLD");
        assert_eq!(cfg.stale_threshold, cfg.rsync_timeout);
    }
}
