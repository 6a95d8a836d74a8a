use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use hostrun_exec::error::{ExecError, RemoteFailure};
use hostrun_exec::remote::{LOCALE_ENV, RemoteOptions, RemoteSessionRunner};
use hostrun_exec::result::HostTarget;
use hostrun_exec::retry::RetryPolicy;
use hostrun_exec::traits::{ChannelEvent, ChannelIo, Connector, RemoteSession};

// Mock implementations
#[derive(Clone)]
enum Dispatch {
    Fail,
    Events(Vec<ChannelEvent>),
    /// Deliver these, then never answer again
    Hang(Vec<ChannelEvent>),
    /// Deliver the first batch, go quiet for a while, then deliver the second
    Quiet(Vec<ChannelEvent>, Duration, Vec<ChannelEvent>),
}

struct MockConnector {
    /// How long each connect takes
    latency: Duration,
    failures: u32,
    fail_with: ExecError,
    dispatch: Dispatch,
    connects: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
    env: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockConnector {
    fn new(dispatch: Dispatch) -> Self {
        Self {
            latency: Duration::ZERO,
            failures: 0,
            fail_with: ExecError::Transport("connection refused".to_string()),
            dispatch,
            connects: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            env: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn slow(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn failing(mut self, failures: u32, fail_with: ExecError) -> Self {
        self.failures = failures;
        self.fail_with = fail_with;
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, _target: &HostTarget) -> Result<MockSession, ExecError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.latency).await;
        if attempt <= self.failures {
            return Err(self.fail_with.clone());
        }
        Ok(MockSession {
            dispatch: self.dispatch.clone(),
            closed: self.closed.clone(),
            env: self.env.clone(),
        })
    }
}

struct MockSession {
    dispatch: Dispatch,
    closed: Arc<AtomicBool>,
    env: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl RemoteSession for MockSession {
    type Channel = MockChannel;

    async fn dispatch(
        &mut self,
        _cmd: &str,
        env: &[(&str, &str)],
    ) -> Result<MockChannel, ExecError> {
        assert!(
            !self.closed.load(Ordering::SeqCst),
            "dispatch on a closed session"
        );
        *self.env.lock().unwrap() = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();

        match &self.dispatch {
            Dispatch::Fail => Err(ExecError::IoError("exec request rejected by server".into())),
            Dispatch::Events(events) => Ok(MockChannel::new(events.clone(), false)),
            Dispatch::Hang(events) => Ok(MockChannel::new(events.clone(), true)),
            Dispatch::Quiet(before, gap, after) => {
                let mut channel = MockChannel::new([before.clone(), after.clone()].concat(), false);
                channel.quiet = Some((before.len(), *gap));
                Ok(channel)
            }
        }
    }

    async fn close(self) -> Result<(), ExecError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    events: VecDeque<ChannelEvent>,
    hang: bool,
    /// Go silent for the duration once this many events were delivered
    quiet: Option<(usize, Duration)>,
    delivered: usize,
    // Kept across dropped `wait` futures so the gap is not restarted
    resume_at: Option<tokio::time::Instant>,
}

impl MockChannel {
    fn new(events: Vec<ChannelEvent>, hang: bool) -> Self {
        Self {
            events: events.into(),
            hang,
            quiet: None,
            delivered: 0,
            resume_at: None,
        }
    }
}

#[async_trait]
impl ChannelIo for MockChannel {
    async fn wait(&mut self) -> Option<ChannelEvent> {
        if let Some((after, gap)) = self.quiet {
            if self.delivered == after {
                let deadline = *self
                    .resume_at
                    .get_or_insert_with(|| tokio::time::Instant::now() + gap);
                tokio::time::sleep_until(deadline).await;
                self.quiet = None;
            }
        }
        if let Some(event) = self.events.pop_front() {
            self.delivered += 1;
            return Some(event);
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        None
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        Ok(())
    }
}

fn target() -> HostTarget {
    HostTarget::new("10.0.0.7", "ci", "/keys/id_ed25519")
}

fn options(timeout: Duration, attempts: u32, wait: Duration) -> RemoteOptions {
    RemoteOptions {
        timeout,
        connect_retry: RetryPolicy::new(attempts, wait),
        connect_timeout: Duration::from_secs(5),
        echo: false,
    }
}

fn out(s: &str) -> ChannelEvent {
    ChannelEvent::Stdout(s.as_bytes().to_vec())
}

#[tokio::test]
async fn test_echo_hello() {
    let connector = MockConnector::new(Dispatch::Events(vec![
        out("hello\n"),
        ChannelEvent::ExitStatus(0),
        ChannelEvent::Eof,
        ChannelEvent::Closed,
    ]));
    let closed = connector.closed.clone();
    let env = connector.env.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(1), 1, Duration::ZERO),
    );
    let result = runner.run(&target(), "echo hello").await.unwrap();

    assert_eq!(result.exit_status, 0);
    assert_eq!(result.stdout_chunks, vec!["hello\n".to_string()]);
    assert!(!result.stderr_observed);
    assert!(closed.load(Ordering::SeqCst));

    let expected: Vec<(String, String)> = LOCALE_ENV
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    assert_eq!(*env.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_nonzero_exit_keeps_output() {
    let connector = MockConnector::new(Dispatch::Events(vec![
        out("boom\n"),
        ChannelEvent::Stderr(b"trace\n".to_vec()),
        ChannelEvent::ExitStatus(3),
        ChannelEvent::Closed,
    ]));
    let closed = connector.closed.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(1), 1, Duration::ZERO),
    );
    let err = runner.run(&target(), "false").await.unwrap_err();

    match err {
        ExecError::RemoteExecutionFailed(RemoteFailure::NonZeroExit {
            status,
            stdout_chunks,
        }) => {
            assert_eq!(status, 3);
            assert_eq!(stdout_chunks.concat(), "boom\n");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_dispatch_failure_closes_session() {
    let connector = MockConnector::new(Dispatch::Fail);
    let closed = connector.closed.clone();
    let connects = connector.connects.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(1), 3, Duration::ZERO),
    );
    let err = runner.run(&target(), "uptime").await.unwrap_err();

    assert!(matches!(
        err,
        ExecError::RemoteExecutionFailed(RemoteFailure::Dispatch(_))
    ));
    assert!(closed.load(Ordering::SeqCst));
    // Dispatch failures are single-shot
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_retries_then_succeeds() {
    let connector = MockConnector::new(Dispatch::Events(vec![
        ChannelEvent::ExitStatus(0),
        ChannelEvent::Closed,
    ]))
    .failing(2, ExecError::Transport("connection reset".to_string()));
    let connects = connector.connects.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(1), 5, Duration::from_millis(10)),
    );
    let result = runner.run(&target(), "true").await.unwrap();

    assert!(result.success());
    assert!(result.stdout_chunks.is_empty());
    assert_eq!(connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_connect_exhaustion_fails_fast() {
    let connector = MockConnector::new(Dispatch::Fail)
        .failing(u32::MAX, ExecError::Transport("no route to host".to_string()));
    let connects = connector.connects.clone();
    let closed = connector.closed.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(1), 3, Duration::from_millis(20)),
    );
    let start = Instant::now();
    let err = runner.run(&target(), "true").await.unwrap_err();

    match err {
        ExecError::ConnectionFailed {
            target,
            attempts,
            reason,
        } => {
            assert_eq!(target, "ci@10.0.0.7:22");
            assert_eq!(attempts, 3);
            assert!(reason.contains("no route to host"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert!(!closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_authentication_failures_are_retried() {
    let connector = MockConnector::new(Dispatch::Fail)
        .failing(u32::MAX, ExecError::AuthenticationFailed("denied".to_string()));
    let connects = connector.connects.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(1), 2, Duration::ZERO),
    );
    let err = runner.run(&target(), "true").await.unwrap_err();

    assert!(matches!(err, ExecError::ConnectionFailed { attempts: 2, .. }));
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_key_error_is_not_retried() {
    let connector = MockConnector::new(Dispatch::Fail)
        .failing(u32::MAX, ExecError::SshKeyError("key file not found".to_string()));
    let connects = connector.connects.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(1), 5, Duration::from_secs(10)),
    );
    let err = runner.run(&target(), "true").await.unwrap_err();

    assert!(matches!(err, ExecError::SshKeyError(_)));
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_quiet_command_outlasting_timeout_succeeds() {
    let connector = MockConnector::new(Dispatch::Quiet(
        vec![out("training started\n")],
        Duration::from_millis(200),
        vec![
            out("done\n"),
            ChannelEvent::ExitStatus(0),
            ChannelEvent::Eof,
            ChannelEvent::Closed,
        ],
    ));
    let closed = connector.closed.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_millis(50), 1, Duration::ZERO),
    );
    let result = runner.run(&target(), "./train.sh").await.unwrap();

    assert_eq!(result.exit_status, 0);
    assert_eq!(
        result.stdout_chunks,
        vec!["training started\n".to_string(), "done\n".to_string()]
    );
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancel_during_drain() {
    let connector = MockConnector::new(Dispatch::Hang(vec![]));
    let closed = connector.closed.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(30), 1, Duration::ZERO),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = runner
        .run_cancellable(&target(), "tail -f /var/log/syslog", &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::Cancelled));
    assert!(closed.load(Ordering::SeqCst));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_cancel_during_connect() {
    let connector = MockConnector::new(Dispatch::Fail).slow(Duration::from_secs(3));
    let connects = connector.connects.clone();

    let runner = RemoteSessionRunner::new(
        connector,
        options(Duration::from_secs(1), 5, Duration::ZERO),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let err = runner
        .run_cancellable(&target(), "true", &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::Cancelled));
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_empty_command_rejected() {
    let connector = MockConnector::new(Dispatch::Fail);
    let connects = connector.connects.clone();

    let runner = RemoteSessionRunner::new(connector, RemoteOptions::default());
    let err = runner.run(&target(), "   ").await.unwrap_err();

    assert!(matches!(err, ExecError::ConfigError(_)));
    assert_eq!(connects.load(Ordering::SeqCst), 0);
}
