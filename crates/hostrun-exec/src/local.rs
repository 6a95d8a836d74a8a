//! Local command execution with retry, using `tokio::process`

use std::time::Instant;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::retry::{Attempt, RetryError, RetryPolicy, retry};

/// Output of one local attempt
struct LocalOutput {
    status: i32,
    stdout: String,
    stderr: String,
}

/// Local command runner
///
/// Runs a command through a local shell until it exits zero or the retry
/// policy is exhausted.
#[derive(Debug, Clone)]
pub struct LocalRetryRunner {
    policy: RetryPolicy,
    shell: String,
}

impl LocalRetryRunner {
    /// Create a runner using `sh`
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell (invoked as `<shell> -c <cmd>`)
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Get the retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `cmd`, retrying on non-zero exit
    ///
    /// # Errors
    /// - `ExecError::ConfigError` for an empty command or zero attempts
    /// - `ExecError::SpawnError` if the shell cannot be started
    /// - `ExecError::ExecutionExhausted` if no attempt exits zero
    #[instrument(skip(self), level = "debug")]
    pub async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        if cmd.trim().is_empty() {
            return Err(ExecError::ConfigError("command must not be empty".to_string()));
        }
        self.policy.validate()?;

        let start = Instant::now();
        debug!(command = %cmd, "running cmd");

        let result = retry(
            &self.policy,
            "local command",
            &CancellationToken::new(),
            |attempt| async move {
                match self.execute(cmd).await {
                    Ok(output) if output.status == 0 => Attempt::Done(output),
                    Ok(output) => {
                        debug!(attempt, "run was unsuccessful");
                        Attempt::Retry(ExecError::CommandFailed {
                            status: output.status,
                            stderr: output.stderr,
                        })
                    }
                    Err(e) => Attempt::Fatal(e),
                }
            },
        )
        .await;

        match result {
            Ok(output) => Ok(CommandResult {
                exit_status: output.status,
                stdout_chunks: if output.stdout.is_empty() {
                    Vec::new()
                } else {
                    vec![output.stdout]
                },
                stderr_observed: !output.stderr.is_empty(),
                duration: start.elapsed(),
            }),
            Err(RetryError::Exhausted { attempts, last }) => {
                let last_exit_status = last.exit_status().unwrap_or(-1);
                Err(ExecError::ExecutionExhausted {
                    command: cmd.to_string(),
                    last_exit_status,
                    attempts,
                })
            }
            Err(RetryError::Fatal(e)) => Err(e),
            Err(RetryError::Cancelled) => Err(ExecError::Cancelled),
        }
    }

    /// Single attempt
    async fn execute(&self, cmd: &str) -> Result<LocalOutput, ExecError> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(cmd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        // Blocks until the shell command returns
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(exit_status = status, "exit status");
        debug!(stdout = %stdout, "stdout");
        if !stderr.is_empty() {
            error!(stderr = %stderr, "stderr");
        }

        Ok(LocalOutput {
            status,
            stdout,
            stderr,
        })
    }
}
