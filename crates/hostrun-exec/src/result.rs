//! Result and target types for command execution

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success, -1 when the remote never reported one)
    pub exit_status: i32,
    /// stdout output in the order it was received
    pub stdout_chunks: Vec<String>,
    /// Whether any stderr bytes were seen
    pub stderr_observed: bool,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Concatenate all stdout chunks
    #[must_use]
    pub fn stdout(&self) -> String {
        self.stdout_chunks.concat()
    }
}

/// Remote endpoint for one execution call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTarget {
    /// Host address
    pub host: String,
    /// Username
    pub user: String,
    /// Private key path, or `env:NAME` for a base64 key in the environment
    pub key_path: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub ssh_port: u16,
}

fn default_port() -> u16 {
    22
}

impl HostTarget {
    /// Create a new target on the default SSH port
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_path: key_path.into(),
            ssh_port: 22,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.ssh_port)
    }
}
