//! SSH transport using russh crate

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::{ChannelMsg, Disconnect, client};
use tracing::{debug, info, instrument};

use crate::error::ExecError;
use crate::keys::KeySource;
use crate::result::HostTarget;
use crate::traits::{ChannelEvent, ChannelIo, Connector, RemoteSession};

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Unknown hosts are accepted, like StrictHostKeyChecking=no
        debug!(
            fingerprint = %server_public_key.fingerprint(ssh_key::HashAlg::Sha256),
            "accepting server host key"
        );
        Ok(true)
    }
}

/// Keep-alives left unanswered before the peer is considered dead
const KEEPALIVE_MAX: usize = 3;

/// Opens authenticated russh sessions
#[derive(Debug, Clone)]
pub struct SshConnector {
    keepalive: Duration,
}

impl SshConnector {
    /// Create a connector with a 60 second keep-alive
    #[must_use]
    pub fn new() -> Self {
        Self {
            keepalive: Duration::from_secs(60),
        }
    }

    /// Set the transport keep-alive interval
    #[must_use]
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Session = SshSession;

    #[instrument(skip(self, target), fields(remote = %target))]
    async fn connect(&self, target: &HostTarget) -> Result<SshSession, ExecError> {
        // Key problems are not connection-layer failures; they fail the attempt terminally
        let key = KeySource::parse(&target.key_path)
            .load()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        info!(
            host = %target.host,
            port = target.ssh_port,
            user = %target.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config {
            keepalive_interval: Some(self.keepalive),
            // Unanswered keep-alives before the session is dropped and the channel closes
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let mut handle = client::connect(
            config,
            (&target.host[..], target.ssh_port),
            SshClientHandler,
        )
        .await
        .map_err(|e| ExecError::Transport(e.to_string()))?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = handle
            .authenticate_publickey(
                &target.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "public key authentication rejected".to_string(),
            ));
        }

        info!(host = %target.host, "SSH connected and authenticated");

        Ok(SshSession {
            handle,
            remote: target.to_string(),
        })
    }
}

/// A connected russh session
pub struct SshSession {
    handle: client::Handle<SshClientHandler>,
    remote: String,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    type Channel = SshChannel;

    async fn dispatch(
        &mut self,
        cmd: &str,
        env: &[(&str, &str)],
    ) -> Result<SshChannel, ExecError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .request_pty(false, "xterm", 80, 24, 0, 0, &[])
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        // Servers without a matching AcceptEnv ignore these silently
        for (name, value) in env {
            channel
                .set_env(false, *name, *value)
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
        }

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut channel = SshChannel {
            inner: channel,
            backlog: VecDeque::new(),
        };
        channel.await_exec_reply().await?;

        // Nothing is ever written to the remote stdin
        channel
            .inner
            .eof()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        Ok(channel)
    }

    async fn close(self) -> Result<(), ExecError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        info!(remote = %self.remote, "SSH disconnected");
        Ok(())
    }
}

/// Command channel of an [`SshSession`]
pub struct SshChannel {
    inner: russh::Channel<client::Msg>,
    /// Events that arrived while waiting for the exec reply
    backlog: VecDeque<ChannelEvent>,
}

impl SshChannel {
    async fn await_exec_reply(&mut self) -> Result<(), ExecError> {
        loop {
            match self.inner.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(ExecError::IoError(
                        "exec request rejected by server".to_string(),
                    ));
                }
                Some(msg) => self.backlog.push_back(channel_event(msg)),
                None => {
                    return Err(ExecError::IoError(
                        "channel closed before exec reply".to_string(),
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl ChannelIo for SshChannel {
    async fn wait(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.inner.wait().await.map(channel_event)
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.inner
            .close()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }
}

fn channel_event(msg: ChannelMsg) -> ChannelEvent {
    match msg {
        ChannelMsg::Data { data } => ChannelEvent::Stdout(data.to_vec()),
        // SSH_EXTENDED_DATA_STDERR
        ChannelMsg::ExtendedData { data, ext: 1 } => ChannelEvent::Stderr(data.to_vec()),
        ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
        ChannelMsg::ExitSignal { signal_name, .. } => {
            ChannelEvent::ExitSignal(format!("{signal_name:?}"))
        }
        ChannelMsg::Eof => ChannelEvent::Eof,
        ChannelMsg::Close => ChannelEvent::Closed,
        _ => ChannelEvent::Other,
    }
}
