//! External command execution for shell steps.
//!
//! Commands run through `sh -c "set -e; <command>"` (`cmd /C` on Windows)
//! in a working directory, inheriting the environment. Stdout and stderr are
//! captured into one combined output that is reported when the command
//! fails or times out.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Upper bound on a single shell step.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Errors that can occur while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to create working directory '{path}': {source}")]
    WorkDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed while waiting for command '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{command}' failed with exit code {exit_code}. Output: {output}")]
    Failed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("command '{command}' timed out after {timeout:?}. Output: {output}")]
    Timeout {
        command: String,
        timeout: Duration,
        output: String,
    },

    #[error("command '{command}' was cancelled")]
    Cancelled { command: String },
}

/// Result of a successful command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Interleaved stdout and stderr.
    pub output: String,
    pub duration: Duration,
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("set -e; {}", command));
        cmd
    }
}

/// Runs `command` in `work_dir`.
///
/// # Arguments
///
/// * `command` - Shell command line
/// * `work_dir` - Working directory, must exist
/// * `timeout` - Limit for the whole run, `None` for no limit
/// * `cancel` - Kills the command when fired
///
/// # Errors
///
/// Returns `CommandError` if the command cannot be started, exits with a
/// non-zero status, times out or is cancelled. The child process is killed
/// in the last two cases.
pub async fn execute_command(
    command: &str,
    work_dir: &Path,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<CommandOutput, CommandError> {
    info!(
        command = %command,
        work_dir = %work_dir.display(),
        timeout = ?timeout,
        "Running command"
    );
    let start = Instant::now();

    let child = shell_command(command)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let mut output = String::new();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = with_limit(timeout, collect_output(child, &mut output)) => Some(result),
    };

    let status = match outcome {
        None => {
            return Err(CommandError::Cancelled {
                command: command.to_string(),
            })
        }
        Some(None) => {
            return Err(CommandError::Timeout {
                command: command.to_string(),
                timeout: timeout.unwrap_or_default(),
                output,
            })
        }
        Some(Some(result)) => result.map_err(|source| CommandError::Wait {
            command: command.to_string(),
            source,
        })?,
    };

    let exit_code = status.code().unwrap_or(-1);
    if !status.success() {
        return Err(CommandError::Failed {
            command: command.to_string(),
            exit_code,
            output,
        });
    }

    let duration = start.elapsed();
    info!(command = %command, duration = ?duration, "Command completed");
    Ok(CommandOutput {
        exit_code,
        output,
        duration,
    })
}

/// `None` when `timeout` elapsed first.
async fn with_limit<F: std::future::Future>(
    timeout: Option<Duration>,
    future: F,
) -> Option<F::Output> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future).await.ok(),
        None => Some(future.await),
    }
}

async fn collect_output(mut child: Child, output: &mut String) -> std::io::Result<ExitStatus> {
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut stdout_done = stdout.is_none();
    let mut stderr_done = stderr.is_none();

    while !(stdout_done && stderr_done) {
        tokio::select! {
            line = next_line(&mut stdout), if !stdout_done => match line {
                Some(line) => {
                    debug!("[stdout] {}", line);
                    output.push_str(&line);
                    output.push('\n');
                }
                None => stdout_done = true,
            },
            line = next_line(&mut stderr), if !stderr_done => match line {
                Some(line) => {
                    debug!("[stderr] {}", line);
                    output.push_str(&line);
                    output.push('\n');
                }
                None => stderr_done = true,
            },
        }
    }

    child.wait().await
}

async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_runs_in_work_dir() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let result = execute_command(
            "printf '{\"a\":1}\\n' > out.jsonl; echo done",
            dir.path(),
            Some(Duration::from_secs(10)),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "done\n");
        let written = std::fs::read_to_string(dir.path().join("out.jsonl")).unwrap();
        assert_eq!(written, "{\"a\":1}\n");
    }

    #[tokio::test]
    async fn test_failure_reports_combined_output() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let err = execute_command(
            "echo before; echo oops >&2; false; echo never",
            dir.path(),
            None,
            &cancel,
        )
        .await
        .unwrap_err();

        match err {
            CommandError::Failed {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, 1);
                assert!(output.contains("before"));
                assert!(output.contains("oops"));
                assert!(!output.contains("never"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inherits_environment() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("STEPFORGE_EXECUTOR_TEST", "inherited");
        let result = execute_command(
            "echo $STEPFORGE_EXECUTOR_TEST",
            dir.path(),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(result.output.trim(), "inherited");
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = TempDir::new().unwrap();
        let err = execute_command(
            "echo started; sleep 5",
            dir.path(),
            Some(Duration::from_millis(200)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = execute_command("sleep 5", dir.path(), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_missing_work_dir() {
        let err = execute_command(
            "true",
            Path::new("/nonexistent/stepforge"),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
