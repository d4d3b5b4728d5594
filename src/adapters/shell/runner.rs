//! `CommandRunner` backed by `sh -c`, with timeout and process-group kill.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::domain::models::CommandResult;
use crate::domain::ports::{CommandRunner, RunOptions};

const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(5_000);

/// Runs commands through `sh -c` in their own process group.
///
/// On timeout the whole group receives SIGTERM; if it is still alive after
/// the grace period it is killed outright.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    kill_grace: Duration,
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl ShellCommandRunner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM to process group failed");
        }
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            warn!(pid, grace_ms = self.kill_grace.as_millis() as u64, "process ignored SIGTERM, killing");
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
            let _ = child.kill().await;
        }
    }

    async fn wait_with_timeout(&self, child: &mut Child, timeout: Option<Duration>) -> (std::io::Result<ExitStatus>, bool) {
        let Some(timeout) = timeout else {
            return (child.wait().await, false);
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status, false),
            Err(_) => {
                self.terminate(child).await;
                (child.wait().await, true)
            }
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn signal_name(status: &ExitStatus) -> Option<String> {
    status
        .signal()
        .map(|sig| Signal::try_from(sig).map_or_else(|_| sig.to_string(), |s| s.as_str().to_string()))
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str, cwd: &Path, opts: RunOptions) -> CommandResult {
        let started_at = Utc::now();
        let clock = Instant::now();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .envs(&opts.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command, cwd = %cwd.display(), error = %e, "failed to spawn command");
                return CommandResult::spawn_failure(command, cwd, e);
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let ((status, timed_out), stdout, stderr) = futures::join!(
            self.wait_with_timeout(&mut child, opts.timeout),
            read_pipe(stdout),
            read_pipe(stderr)
        );

        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        let (exit_code, signal, success) = match &status {
            Ok(status) => (status.code(), signal_name(status), status.success()),
            Err(_) => (None, None, false),
        };
        let mut stderr = stderr;
        if let Err(e) = status {
            stderr.push_str(&format!("\nwait failed: {e}"));
        }

        debug!(command, exit_code, timed_out, duration_ms, "command finished");

        CommandResult {
            ok: success && !timed_out,
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            exit_code,
            signal,
            stdout,
            stderr,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
            timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let runner = ShellCommandRunner::default();
        let result = runner
            .run("echo hello; echo oops >&2", dir.path(), RunOptions::default())
            .await;
        assert!(result.ok);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout_trimmed(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_ok() {
        let dir = TempDir::new().unwrap();
        let result = ShellCommandRunner::default()
            .run("exit 3", dir.path(), RunOptions::default())
            .await;
        assert!(!result.ok);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_timeout_terminates_process() {
        let dir = TempDir::new().unwrap();
        let runner = ShellCommandRunner::new(Duration::from_millis(200));
        let started = Instant::now();
        let result = runner
            .run(
                "sleep 30",
                dir.path(),
                RunOptions::with_timeout(Duration::from_millis(150)),
            )
            .await;
        assert!(result.timed_out);
        assert!(!result.ok);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn test_env_is_passed_through() {
        let dir = TempDir::new().unwrap();
        let result = ShellCommandRunner::default()
            .run(
                "printf %s \"$COWAI_STATE_FILE\"",
                dir.path(),
                RunOptions::default().env("COWAI_STATE_FILE", "/tmp/state.json"),
            )
            .await;
        assert_eq!(result.stdout, "/tmp/state.json");
    }

    #[tokio::test]
    async fn test_missing_cwd_reports_failure() {
        let result = ShellCommandRunner::default()
            .run("true", Path::new("/definitely/not/here"), RunOptions::default())
            .await;
        assert!(!result.ok);
        assert!(result.exit_code.is_none());
        assert!(!result.stderr.is_empty());
    }
}
