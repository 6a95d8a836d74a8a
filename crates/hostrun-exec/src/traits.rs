//! Transport seams between the runner and the SSH library
//!
//! `RemoteSessionRunner` only talks to these traits, so the connect, dispatch
//! and drain logic can be driven by scripted sessions in tests.

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::HostTarget;

/// One event delivered on a command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes on the output pipe
    Stdout(Vec<u8>),
    /// Bytes on the error pipe
    Stderr(Vec<u8>),
    /// Remote process reported its exit status
    ExitStatus(u32),
    /// Remote process was killed by a signal
    ExitSignal(String),
    /// Remote side will send no more data
    Eof,
    /// Channel closed
    Closed,
    /// Anything else (window adjustments, request replies)
    Other,
}

/// Read side of a dispatched command channel
#[async_trait]
pub trait ChannelIo: Send {
    /// Wait for the next event; `None` once the channel is gone
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose an event.
    async fn wait(&mut self) -> Option<ChannelEvent>;

    /// Shut down and close the channel
    async fn close(&mut self) -> Result<(), ExecError>;
}

/// A connected, authenticated session able to run one command
#[async_trait]
pub trait RemoteSession: Send + Sized {
    /// Channel type produced by [`RemoteSession::dispatch`]
    type Channel: ChannelIo;

    /// Start `cmd` with a PTY and the given environment
    async fn dispatch(
        &mut self,
        cmd: &str,
        env: &[(&str, &str)],
    ) -> Result<Self::Channel, ExecError>;

    /// Disconnect; consumes the session so it cannot be reused
    async fn close(self) -> Result<(), ExecError>;
}

/// Opens sessions to remote hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Session type produced on success
    type Session: RemoteSession;

    /// Make a single connection attempt
    ///
    /// Connection-layer failures should be reported with a retryable
    /// [`ExecError`] (see [`ExecError::is_retryable`]).
    async fn connect(&self, target: &HostTarget) -> Result<Self::Session, ExecError>;
}
