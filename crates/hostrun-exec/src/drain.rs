//! Draining of a dispatched command channel
//!
//! The drainer reads stdout and stderr as they become ready, without ever
//! blocking longer than the readiness timeout, and only reads the exit status
//! once the remote side has reported it *and* every buffered byte has been
//! consumed. A channel closing early does not end the drain while data is
//! still pending. A readiness wait that expires is not an error: quiet
//! commands are polled again, and a dead peer is detected by the transport
//! keep-alive, which closes the channel.

use std::io::Write;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::error::{ExecError, RemoteFailure};
use crate::traits::{ChannelEvent, ChannelIo};

/// Everything the drain loop learned from the channel
#[derive(Debug, Clone)]
pub struct DrainOutcome {
    /// Remote exit status, -1 if the remote never reported one
    pub exit_status: i32,
    /// stdout in arrival order
    pub stdout_chunks: Vec<String>,
    /// Whether any stderr bytes were seen
    pub stderr_observed: bool,
    /// Number of stderr bytes read and discarded
    pub stderr_bytes: usize,
}

/// Local view of what the channel has delivered but we have not consumed yet
#[derive(Debug, Default)]
struct Buffers {
    /// Complete UTF-8 ready to hand out
    stdout: Vec<u8>,
    /// Trailing bytes of a character split across bursts
    partial: Vec<u8>,
    stderr: usize,
    exit_status: Option<u32>,
    exit_signal: Option<String>,
    closed: bool,
}

impl Buffers {
    fn absorb(&mut self, event: Option<ChannelEvent>) {
        match event {
            Some(ChannelEvent::Stdout(bytes)) => {
                self.partial.extend_from_slice(&bytes);
                self.settle(false);
            }
            Some(ChannelEvent::Stderr(bytes)) => self.stderr += bytes.len(),
            Some(ChannelEvent::ExitStatus(status)) => {
                trace!(status, "exit status received");
                self.exit_status = Some(status);
                self.settle(true);
            }
            Some(ChannelEvent::ExitSignal(signal)) => {
                trace!(signal = %signal, "exit signal received");
                self.exit_signal = Some(signal);
                self.settle(true);
            }
            Some(ChannelEvent::Eof) => self.settle(true),
            Some(ChannelEvent::Closed) | None => {
                self.closed = true;
                self.settle(true);
            }
            Some(ChannelEvent::Other) => {}
        }
    }

    /// Move complete characters from `partial` to `stdout`; everything on flush
    fn settle(&mut self, flush: bool) {
        let cut = if flush {
            self.partial.len()
        } else {
            complete_prefix_len(&self.partial)
        };
        let tail = self.partial.split_off(cut);
        self.stdout.append(&mut self.partial);
        self.partial = tail;
    }

    fn stdout_ready(&self) -> bool {
        !self.stdout.is_empty()
    }

    fn stderr_ready(&self) -> bool {
        self.stderr > 0
    }

    fn take_stdout(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.stdout)).into_owned()
    }

    fn take_stderr(&mut self) -> usize {
        std::mem::take(&mut self.stderr)
    }
}

/// Length of the longest prefix that does not end inside a UTF-8 sequence
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let mut offset = 0;
    loop {
        match std::str::from_utf8(&bytes[offset..]) {
            Ok(_) => return bytes.len(),
            Err(e) => match e.error_len() {
                // Invalid bytes mid-stream; keep going, lossy decoding handles them
                Some(len) => offset += e.valid_up_to() + len,
                None => return offset + e.valid_up_to(),
            },
        }
    }
}

/// Reads a command channel to completion
pub struct ChannelDrainer<C> {
    channel: C,
    timeout: Duration,
    echo: bool,
}

impl<C: ChannelIo> ChannelDrainer<C> {
    /// Create a drainer that waits at most `timeout` for channel readiness
    pub fn new(channel: C, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            echo: false,
        }
    }

    /// Also write each stdout chunk to the local stdout as it arrives
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Drain the channel and return the exit status and output
    ///
    /// The channel is closed before this returns, on every path.
    ///
    /// # Errors
    /// - `ExecError::Cancelled` if `cancel` fires
    /// - `ExecError::RemoteExecutionFailed` if the remote was killed by a
    ///   signal and no exit status can be retrieved
    #[instrument(skip_all, level = "debug", fields(timeout = ?self.timeout))]
    pub async fn drain(mut self, cancel: &CancellationToken) -> Result<DrainOutcome, ExecError> {
        let mut buffers = Buffers::default();
        let mut stdout_chunks = Vec::new();
        let mut stderr_observed = false;
        let mut stderr_bytes = 0;

        debug!("reading from remote");

        while !buffers.closed || buffers.stdout_ready() || buffers.stderr_ready() {
            if let Err(e) = self.poll_ready(&mut buffers, cancel).await {
                self.shutdown().await;
                return Err(e);
            }

            let mut got_chunk = false;

            if buffers.stdout_ready() {
                let chunk = buffers.take_stdout();
                trace!(bytes = chunk.len(), "stdout chunk");
                if self.echo {
                    echo(&chunk);
                }
                stdout_chunks.push(chunk);
                got_chunk = true;
            }

            if buffers.stderr_ready() {
                // Read only so the remote never blocks on a full stderr window
                stderr_bytes += buffers.take_stderr();
                stderr_observed = true;
                got_chunk = true;
            }

            if !got_chunk
                && buffers.exit_status.is_some()
                && !buffers.stderr_ready()
                && !buffers.stdout_ready()
            {
                debug!("output buffers are empty, exiting");
                break;
            }
        }

        self.shutdown().await;

        buffers.settle(true);
        if buffers.stdout_ready() {
            stdout_chunks.push(buffers.take_stdout());
        }

        debug!("reading exit status");
        let exit_status = match (buffers.exit_status, buffers.exit_signal) {
            (Some(status), _) => status.cast_signed(),
            (None, Some(signal)) => {
                return Err(ExecError::RemoteExecutionFailed(RemoteFailure::ExitStatus(
                    format!("remote process terminated by signal {signal}"),
                )));
            }
            (None, None) => {
                warn!("channel closed without an exit status");
                -1
            }
        };
        debug!(exit_status, chunks = stdout_chunks.len(), stderr_bytes, "drain complete");

        Ok(DrainOutcome {
            exit_status,
            stdout_chunks,
            stderr_observed,
            stderr_bytes,
        })
    }

    /// Wait for readiness, then absorb everything already delivered
    ///
    /// Once the exit status is known nothing further is awaited: the remote
    /// sends its output before the status, so whatever is still owed has
    /// already been queued on the channel.
    async fn poll_ready(
        &mut self,
        buffers: &mut Buffers,
        cancel: &CancellationToken,
    ) -> Result<(), ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        if !buffers.closed && buffers.exit_status.is_none() {
            let timeout = self.timeout;
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ExecError::Cancelled),
                event = tokio::time::timeout(timeout, self.channel.wait()) => match event {
                    Ok(event) => buffers.absorb(event),
                    Err(_) => {
                        debug!(timeout = ?timeout, "no channel activity, polling again");
                        return Ok(());
                    }
                },
            }
        }

        while !buffers.closed {
            match self.channel.wait().now_or_never() {
                Some(event) => buffers.absorb(event),
                None => break,
            }
        }

        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "channel close failed");
        }
    }
}

fn echo(chunk: &str) {
    let mut out = std::io::stdout().lock();
    if let Err(e) = out.write_all(chunk.as_bytes()).and_then(|()| out.flush()) {
        debug!(error = %e, "failed to echo remote output");
    }
}
