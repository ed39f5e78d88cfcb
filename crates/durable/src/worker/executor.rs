//! Shell command execution
//!
//! Runs a job's command line through the platform shell and classifies the
//! result as success, failure (non-zero exit) or exception (the command
//! could not be run to completion).

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

/// Result of running one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exit status zero
    Succeeded { stdout: String },

    /// Non-zero exit status
    Failed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Spawn failure or timeout
    Errored { reason: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded { .. })
    }

    /// Text recorded as the job's `last_error`.
    ///
    /// Success yields the captured stdout, or `None` when it is empty.
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Succeeded { stdout } if stdout.is_empty() => None,
            ExecutionOutcome::Succeeded { stdout } => Some(stdout.clone()),
            ExecutionOutcome::Failed {
                exit_code,
                stdout,
                stderr,
            } => Some(format!("rc={exit_code}; stdout={stdout}; stderr={stderr}")),
            ExecutionOutcome::Errored { reason } => Some(format!("exception: {reason}")),
        }
    }
}

/// Runs command lines with `sh -c` (or `cmd /C` on Windows)
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `command` to completion and capture its output
    pub async fn execute(&self, command: &str) -> ExecutionOutcome {
        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(%command, "failed to spawn command: {}", e);
                return ExecutionOutcome::Errored {
                    reason: format!("failed to spawn command: {e}"),
                };
            }
        };

        let started = Instant::now();
        let output = match self.timeout {
            // Dropping the wait future drops the child, which kills it.
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(%command, timeout_secs = limit.as_secs_f64(), "command timed out");
                    return ExecutionOutcome::Errored {
                        reason: format!("command timed out after {}s", limit.as_secs_f64()),
                    };
                }
            },
            None => child.wait_with_output().await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return ExecutionOutcome::Errored {
                    reason: format!("failed to wait for command: {e}"),
                }
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(
            %command,
            status = %output.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );

        if output.status.success() {
            ExecutionOutcome::Succeeded { stdout }
        } else {
            ExecutionOutcome::Failed {
                exit_code: exit_code(&output.status),
                stdout,
                stderr,
            }
        }
    }
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut c = Command::new("cmd");
    c.args(["/C", command]);
    c
}

#[cfg(not(windows))]
fn shell_command(command: &str) -> Command {
    let mut c = Command::new("sh");
    c.args(["-c", command]);
    c
}

/// Exit code, or the negated signal number for a signal-terminated child.
#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
