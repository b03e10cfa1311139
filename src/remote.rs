use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::process::{run, RunOptions, RunOutput};

/// One SSH destination. The password never joins this struct; it travels
/// separately and only ever reaches the child through the `SSHPASS`
/// environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl SshEndpoint {
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Transport string handed to rsync's `-e` flag.
pub(crate) fn ssh_transport(port: u16) -> String {
    format!("ssh -p {port} -o StrictHostKeyChecking=accept-new")
}

/// `sshpass -e ssh … user@host <command>`. The command string is passed as a
/// single argv element and evaluated by the remote shell; callers escape any
/// interpolated values before composing it.
pub(crate) fn ssh_invocation(endpoint: &SshEndpoint, command: &str) -> (String, Vec<String>) {
    let args = vec![
        "-e".to_string(),
        "ssh".to_string(),
        "-p".to_string(),
        endpoint.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        endpoint.user_at_host(),
        command.to_string(),
    ];
    ("sshpass".to_string(), args)
}

/// `sshpass -e sftp … -b <batch> user@host`.
pub(crate) fn sftp_invocation(endpoint: &SshEndpoint, batch_path: &str) -> (String, Vec<String>) {
    let args = vec![
        "-e".to_string(),
        "sftp".to_string(),
        "-P".to_string(),
        endpoint.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-b".to_string(),
        batch_path.to_string(),
        endpoint.user_at_host(),
    ];
    ("sshpass".to_string(), args)
}

/// Runs `command` on the remote host through password-based ssh.
pub async fn run_remote(
    endpoint: &SshEndpoint,
    password: &str,
    command: &str,
    timeout: Duration,
) -> RunOutput {
    let (program, args) = ssh_invocation(endpoint, command);
    let mut opts = RunOptions::with_timeout(timeout);
    opts.env.push(("SSHPASS".to_string(), password.to_string()));
    run(&program, &args, opts).await
}

/// The `echo` probe backing the test-connection operation.
pub async fn test_connection(
    cfg: &EngineConfig,
    endpoint: &SshEndpoint,
    password: &str,
) -> Result<(), String> {
    let output = run_remote(
        endpoint,
        password,
        "echo ok",
        cfg.ssh_test_connection_timeout,
    )
    .await;
    if output.success() {
        Ok(())
    } else {
        let detail = output.combined(cfg.max_output_size);
        if detail.trim().is_empty() {
            Err("connection failed".to_string())
        } else {
            Err(detail)
        }
    }
}
