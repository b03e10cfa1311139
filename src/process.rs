use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::warn;

/// Invoked with each chunk of stdout before it is buffered.
pub type OutputHook = Arc<dyn Fn(&str) + Send + Sync>;

pub struct RunOptions {
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub on_stdout: Option<OutputHook>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            env: Vec::new(),
            timeout,
            on_stdout: None,
        }
    }
}

/// What a finished (or failed-to-start, or killed) child left behind. The
/// runner resolves every path through this value and never errors out.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub killed: bool,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout then stderr, keeping only the trailing `max_bytes`.
    pub fn combined(&self, max_bytes: usize) -> String {
        let mut merged = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        merged.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !merged.is_empty() && !merged.ends_with('\n') {
                merged.push('\n');
            }
            merged.push_str(&self.stderr);
        }
        truncate_tail(merged, max_bytes)
    }

    pub(crate) fn failure(message: String) -> Self {
        Self {
            code: -1,
            stdout: String::new(),
            stderr: message,
            killed: false,
        }
    }
}

/// Runs a child process with captured output and a hard wall-clock timeout.
///
/// The child gets its own process group so a timeout reaps the entire
/// descendant tree, not just the immediate child.
pub async fn run(program: &str, args: &[String], opts: RunOptions) -> RunOutput {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &opts.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return RunOutput::failure(format!("failed to spawn {program}: {err}")),
    };
    let pid = child.id();

    let stdout_task = tokio::spawn(drain(child.stdout.take(), opts.on_stdout.clone()));
    let stderr_task = tokio::spawn(drain(child.stderr.take(), None));

    let mut killed = false;
    let mut code = -1;
    match tokio::time::timeout(opts.timeout, child.wait()).await {
        Ok(Ok(status)) => code = status.code().unwrap_or(-1),
        Ok(Err(err)) => warn!(program, error = %err, "waiting on child failed"),
        Err(_) => {
            killed = true;
            kill_process_group(&mut child, pid);
            let _ = child.wait().await;
        }
    }

    let stdout = stdout_task.await.unwrap_or_default();
    let mut stderr = stderr_task.await.unwrap_or_default();
    if killed {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str("[TIMEOUT]");
    }

    RunOutput {
        code: if killed { -1 } else { code },
        stdout,
        stderr,
        killed,
    }
}

/// Runs one composite command line through the platform shell. This is the
/// only entry point that accepts a shell string for local execution; all
/// other call sites pass argv arrays.
#[allow(dead_code)]
pub async fn run_shell(script: &str, opts: RunOptions) -> RunOutput {
    #[cfg(windows)]
    {
        run("cmd", &["/C".to_string(), script.to_string()], opts).await
    }
    #[cfg(not(windows))]
    {
        run("sh", &["-c".to_string(), script.to_string()], opts).await
    }
}

async fn drain<R>(pipe: Option<R>, hook: Option<OutputHook>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut collected = String::new();
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                if let Some(hook) = &hook {
                    hook(&chunk);
                }
                collected.push_str(&chunk);
            }
            Err(_) => break,
        }
    }
    collected
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

/// Quotes one value for interpolation into a POSIX shell command string.
/// Every user-supplied string that ends up inside a remote command goes
/// through here.
pub fn shell_escape(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The double-quote flavor used when composing Windows shell-mode lines.
#[allow(dead_code)]
pub fn shell_escape_windows(value: &str) -> String {
    let escaped = value.replace('\\', r"\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Normalizes a native path for consumption by POSIX-flavored transfer
/// tools: forward slashes, lowercased drive letter.
pub fn normalize_local_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let mut chars = forward.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_uppercase() => {
            format!("{}:{}", drive.to_ascii_lowercase(), chars.as_str())
        }
        _ => forward,
    }
}

/// Keeps the trailing `max_bytes` of `text`, respecting char boundaries.
pub fn truncate_tail(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    fn opts(timeout_ms: u64) -> RunOptions {
        RunOptions::with_timeout(Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = run_shell("echo hello; exit 0", opts(5_000)).await;
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.killed);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_success() {
        let out = run_shell("echo oops >&2; exit 3", opts(5_000)).await;
        assert_eq!(out.code, 3);
        assert!(!out.success());
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn spawn_error_resolves_instead_of_failing() {
        let out = run("definitely-not-a-real-binary-3141", &[], opts(1_000)).await;
        assert_eq!(out.code, -1);
        assert!(!out.success());
        assert!(out.stderr.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let started = Instant::now();
        let out = run_shell("sleep 30", opts(200)).await;
        assert!(out.killed);
        assert_eq!(out.code, -1);
        assert!(out.stderr.ends_with("[TIMEOUT]"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stdout_hook_sees_chunks_before_buffering() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let hook: OutputHook = Arc::new(move |chunk: &str| {
            sink.lock().unwrap().push_str(chunk);
        });
        let out = run_shell(
            "printf 'a\\nb\\n'",
            RunOptions {
                env: Vec::new(),
                timeout: Duration::from_secs(5),
                on_stdout: Some(hook),
            },
        )
        .await;
        assert!(out.success());
        assert_eq!(seen.lock().unwrap().as_str(), out.stdout);
    }

    #[tokio::test]
    async fn env_overlay_reaches_the_child() {
        let mut options = opts(5_000);
        options.env.push(("TIDESYNC_TEST_VAR".into(), "42".into()));
        let out = run_shell("echo $TIDESYNC_TEST_VAR", options).await;
        assert_eq!(out.stdout.trim(), "42");
    }

    #[test]
    fn shell_escape_wraps_and_escapes_quotes() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("with space"), "'with space'");
        assert_eq!(shell_escape("it's"), r"'it'\''s'");
        assert_eq!(shell_escape("$HOME;rm -rf"), "'$HOME;rm -rf'");
    }

    #[test]
    fn windows_paths_become_posix_flavored() {
        assert_eq!(
            normalize_local_path(r"C:\Users\me\Sync Dir"),
            "c:/Users/me/Sync Dir"
        );
        assert_eq!(normalize_local_path("/home/me/sync"), "/home/me/sync");
    }

    #[test]
    fn combined_output_keeps_the_tail() {
        let out = RunOutput {
            code: 0,
            stdout: "aaaa".repeat(10),
            stderr: "tail-end".to_string(),
            killed: false,
        };
        let combined = out.combined(12);
        assert_eq!(combined.len(), 12);
        assert!(combined.ends_with("tail-end"));
    }

    #[test]
    fn truncate_tail_respects_char_boundaries() {
        let text = "héllo wörld".to_string();
        let tail = truncate_tail(text, 5);
        assert!(tail.len() <= 5);
        assert!(tail.ends_with("rld"));
    }
}
