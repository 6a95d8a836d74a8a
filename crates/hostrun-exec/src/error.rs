//! Error types for hostrun-exec

use std::fmt;

use thiserror::Error;

/// Errors that can occur during local or remote execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Local command never exited zero within its retry budget
    #[error("command `{command}` failed after {attempts} attempts (last exit status {last_exit_status})")]
    ExecutionExhausted {
        /// Command that was run
        command: String,
        /// Exit status of the final attempt
        last_exit_status: i32,
        /// Number of attempts made
        attempts: u32,
    },

    /// Could not establish a session within the connect retry budget
    #[error("connection to {target} failed after {attempts} attempts: {reason}")]
    ConnectionFailed {
        /// Target in `user@host:port` form
        target: String,
        /// Number of attempts made
        attempts: u32,
        /// Last connection-layer error
        reason: String,
    },

    /// Remote command could not be run to a successful completion
    #[error("remote execution failed: {0}")]
    RemoteExecutionFailed(RemoteFailure),

    /// Caller requested early termination
    #[error("execution cancelled")]
    Cancelled,

    /// Socket, protocol or handshake failure on a single connect attempt
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// A single command attempt exited non-zero
    #[error("command execution failed: {status} - {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// Check if error is a transient connection-layer failure
    ///
    /// Authentication failures are retried like any other connect error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Transport(_) | ExecError::AuthenticationFailed(_))
    }

    /// Remote exit status, if this error carries one
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecError::RemoteExecutionFailed(RemoteFailure::NonZeroExit { status, .. }) => {
                Some(*status)
            }
            ExecError::ExecutionExhausted {
                last_exit_status, ..
            } => Some(*last_exit_status),
            ExecError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why a dispatched remote command did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailure {
    /// The exec request was rejected or never answered
    Dispatch(String),
    /// The exit status could not be retrieved
    ExitStatus(String),
    /// The remote command ran and exited non-zero
    NonZeroExit {
        /// Remote exit status
        status: i32,
        /// Output collected before the command exited
        stdout_chunks: Vec<String>,
    },
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteFailure::Dispatch(msg) => write!(f, "dispatch: {msg}"),
            RemoteFailure::ExitStatus(msg) => write!(f, "exit-status: {msg}"),
            RemoteFailure::NonZeroExit { status, .. } => {
                write!(f, "remote command exited with status {status}")
            }
        }
    }
}
