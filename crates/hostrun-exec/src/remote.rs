//! One-shot remote command execution
//!
//! A call walks `Disconnected -> Connected -> Dispatched -> Draining -> Closed`.
//! The session is owned by the call and closed before it returns on every path
//! after a successful connect.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::drain::{ChannelDrainer, DrainOutcome};
use crate::error::{ExecError, RemoteFailure};
use crate::result::{CommandResult, HostTarget};
use crate::retry::{Attempt, RetryError, RetryPolicy, retry};
use crate::ssh::SshConnector;
use crate::traits::{Connector, RemoteSession};

/// Locale forced on the remote side so output parses the same on every host
pub const LOCALE_ENV: [(&str, &str); 2] = [("LC_ALL", "C.UTF-8"), ("LANG", "C.UTF-8")];

/// Tunables for a remote run
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Readiness timeout while draining; also bounds the dispatch reply
    pub timeout: Duration,
    /// Connect attempts and the wait between them
    pub connect_retry: RetryPolicy,
    /// Deadline for a single connect attempt
    pub connect_timeout: Duration,
    /// Echo stdout chunks to the local stdout as they arrive
    pub echo: bool,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            connect_retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            echo: false,
        }
    }
}

/// Runs a single command on a remote host
#[derive(Debug)]
pub struct RemoteSessionRunner<C = SshConnector> {
    connector: C,
    options: RemoteOptions,
}

impl RemoteSessionRunner<SshConnector> {
    /// Runner backed by russh
    #[must_use]
    pub fn ssh(options: RemoteOptions) -> Self {
        Self::new(SshConnector::new(), options)
    }
}

impl<C: Connector> RemoteSessionRunner<C> {
    /// Create a runner over any connector
    pub fn new(connector: C, options: RemoteOptions) -> Self {
        Self { connector, options }
    }

    /// Get run options
    pub fn options(&self) -> &RemoteOptions {
        &self.options
    }

    /// Run `cmd` on `target`
    ///
    /// # Errors
    /// See [`RemoteSessionRunner::run_cancellable`]
    pub async fn run(&self, target: &HostTarget, cmd: &str) -> Result<CommandResult, ExecError> {
        self.run_cancellable(target, cmd, &CancellationToken::new())
            .await
    }

    /// Run `cmd` on `target`, stopping early if `cancel` fires
    ///
    /// # Errors
    /// - `ExecError::ConfigError` for an empty command or zero connect attempts
    /// - `ExecError::ConnectionFailed` when the connect retry budget runs out
    /// - `ExecError::RemoteExecutionFailed` on dispatch failure, missing exit
    ///   status, or a non-zero exit (the output is kept in the error)
    /// - `ExecError::Cancelled` if `cancel` fires
    #[instrument(skip(self, target, cmd, cancel), fields(remote = %target))]
    pub async fn run_cancellable(
        &self,
        target: &HostTarget,
        cmd: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ExecError> {
        if cmd.trim().is_empty() {
            return Err(ExecError::ConfigError("command must not be empty".to_string()));
        }
        self.options.connect_retry.validate()?;

        let start = Instant::now();

        let mut session = self.connect(target, cancel).await?;
        let outcome = self.execute(&mut session, cmd, cancel).await;
        if let Err(e) = session.close().await {
            warn!(error = %e, "failed to close session");
        }
        let outcome = outcome?;

        let duration = start.elapsed();

        if outcome.exit_status > 0 {
            error!(
                command = %cmd,
                exit_status = outcome.exit_status,
                duration = ?duration,
                "remote command failed"
            );
            return Err(ExecError::RemoteExecutionFailed(RemoteFailure::NonZeroExit {
                status: outcome.exit_status,
                stdout_chunks: outcome.stdout_chunks,
            }));
        }

        info!(
            command = %cmd,
            exit_status = outcome.exit_status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            exit_status: outcome.exit_status,
            stdout_chunks: outcome.stdout_chunks,
            stderr_observed: outcome.stderr_observed,
            duration,
        })
    }

    /// Connect with retry; fails fast once the budget is spent
    async fn connect(
        &self,
        target: &HostTarget,
        cancel: &CancellationToken,
    ) -> Result<C::Session, ExecError> {
        let connect_timeout = self.options.connect_timeout;

        let result = retry(&self.options.connect_retry, "ssh connect", cancel, |attempt| async move {
            debug!(attempt, "opening connection");
            tokio::select! {
                () = cancel.cancelled() => Attempt::Cancelled,
                res = tokio::time::timeout(connect_timeout, self.connector.connect(target)) => match res {
                    Ok(Ok(session)) => Attempt::Done(session),
                    Ok(Err(e)) if e.is_retryable() => Attempt::Retry(e),
                    Ok(Err(e)) => Attempt::Fatal(e),
                    Err(_) => Attempt::Retry(ExecError::Transport(format!(
                        "connect timed out after {connect_timeout:?}"
                    ))),
                },
            }
        })
        .await;

        match result {
            Ok(session) => Ok(session),
            Err(RetryError::Exhausted { attempts, last }) => Err(ExecError::ConnectionFailed {
                target: target.to_string(),
                attempts,
                reason: last.to_string(),
            }),
            Err(RetryError::Fatal(e)) => Err(e),
            Err(RetryError::Cancelled) => Err(ExecError::Cancelled),
        }
    }

    /// Dispatch `cmd` on a connected session and drain its channel
    async fn execute(
        &self,
        session: &mut C::Session,
        cmd: &str,
        cancel: &CancellationToken,
    ) -> Result<DrainOutcome, ExecError> {
        debug!(command = %cmd, "executing command remotely");

        let timeout = self.options.timeout;
        let channel = match tokio::time::timeout(timeout, session.dispatch(cmd, &LOCALE_ENV)).await
        {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                error!(error = %e, "dispatch failed");
                return Err(ExecError::RemoteExecutionFailed(RemoteFailure::Dispatch(
                    e.to_string(),
                )));
            }
            Err(_) => {
                error!(timeout = ?timeout, "dispatch not acknowledged");
                return Err(ExecError::RemoteExecutionFailed(RemoteFailure::Dispatch(
                    format!("no reply within {timeout:?}"),
                )));
            }
        };

        ChannelDrainer::new(channel, timeout)
            .with_echo(self.options.echo)
            .drain(cancel)
            .await
    }
}
