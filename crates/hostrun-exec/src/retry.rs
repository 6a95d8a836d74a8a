//! Fixed-delay retry shared by the local and remote runners

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ExecError;

/// How many times to try, and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay between consecutive attempts
    pub wait_period: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            wait_period: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy
    #[must_use]
    pub fn new(max_attempts: u32, wait_period: Duration) -> Self {
        Self {
            max_attempts,
            wait_period,
        }
    }

    /// Single attempt, no waiting
    #[must_use]
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Reject policies that would never run the operation
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if `max_attempts` is zero
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.max_attempts == 0 {
            return Err(ExecError::ConfigError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a single attempt
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Finished; stop retrying
    Done(T),
    /// Failed in a way another attempt may fix
    Retry(E),
    /// Failed in a way retrying cannot fix
    Fatal(E),
    /// Abandoned because the caller cancelled
    Cancelled,
}

/// Why the retry loop gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt asked to be retried
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last: E,
    },
    /// An attempt failed terminally
    Fatal(E),
    /// Cancelled before or between attempts
    Cancelled,
}

/// Run `op` until it finishes, fails terminally, or the policy runs out
///
/// `op` receives the 1-based attempt number. Between attempts the loop sleeps
/// exactly `policy.wait_period`; there is no sleep after the last attempt.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        debug!(operation, attempt, max_attempts = policy.max_attempts, "starting attempt");

        match op(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Cancelled => {
                debug!(operation, attempt, "attempt cancelled");
                return Err(RetryError::Cancelled);
            }
            Attempt::Fatal(e) => {
                error!(operation, attempt, error = %e, "attempt failed, not retrying");
                return Err(RetryError::Fatal(e));
            }
            Attempt::Retry(e) if attempt >= policy.max_attempts => {
                error!(operation, attempts = attempt, error = %e, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Attempt::Retry(e) => {
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    wait = ?policy.wait_period,
                    "attempt unsuccessful, retrying"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(policy.wait_period) => {}
                }
                attempt += 1;
            }
        }
    }
}
