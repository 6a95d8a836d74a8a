//! hostrun-exec: command execution engine
//!
//! Runs shell commands locally with retry, and on remote hosts over SSH with
//! connection retry and non-blocking draining of the command's output

pub mod drain;
pub mod error;
pub mod keys;
pub mod local;
pub mod remote;
pub mod result;
pub mod retry;
pub mod ssh;
pub mod traits;

pub use error::{ExecError, RemoteFailure};
pub use local::LocalRetryRunner;
pub use remote::{RemoteOptions, RemoteSessionRunner};
pub use result::{CommandResult, HostTarget};
pub use retry::RetryPolicy;
