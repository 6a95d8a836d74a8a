//! Configuration loading and types

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::WrapErr;
use hostrun_exec::{HostTarget, RemoteOptions, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Where the loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No config file found
    Defaults,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults => f.write_str("built-in defaults"),
        }
    }
}

/// Top-level configuration for hostrun
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub settings: Settings,
    /// Local execution defaults
    #[serde(default)]
    pub local: LocalConfig,
    /// Remote execution defaults
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Named remote hosts
    #[serde(default)]
    pub host: Vec<HostEntry>,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Local execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default = "default_local_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_local_wait")]
    pub wait_period_secs: u64,
    /// Shell used as `<shell> -c <cmd>`
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_local_attempts(),
            wait_period_secs: default_local_wait(),
            shell: default_shell(),
        }
    }
}

fn default_local_attempts() -> u32 {
    3
}

fn default_local_wait() -> u64 {
    5
}

fn default_shell() -> String {
    "sh".to_string()
}

impl LocalConfig {
    /// Retry policy for local runs
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.wait_period_secs))
    }
}

/// Remote execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Readiness timeout while draining output
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_max_attempts: u32,
    #[serde(default = "default_connect_wait")]
    pub connect_wait_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            connect_max_attempts: default_connect_attempts(),
            connect_wait_secs: default_connect_wait(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    3600
}

fn default_connect_attempts() -> u32 {
    15
}

fn default_connect_wait() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

impl RemoteConfig {
    /// Runner options for remote runs
    #[must_use]
    pub fn options(&self) -> RemoteOptions {
        RemoteOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            connect_retry: RetryPolicy::new(
                self.connect_max_attempts,
                Duration::from_secs(self.connect_wait_secs),
            ),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            echo: false,
        }
    }
}

/// A named remote host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    /// Name used with `--target`
    pub name: String,
    /// IP address or hostname
    pub host: String,
    /// SSH user (defaults to root)
    #[serde(default = "default_user")]
    pub user: String,
    /// Private key path or `env:NAME`
    pub key_path: String,
    #[serde(default = "default_port")]
    pub ssh_port: u16,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl HostEntry {
    /// Convert to an execution target
    #[must_use]
    pub fn target(&self) -> HostTarget {
        HostTarget::new(&self.host, &self.user, &self.key_path).with_port(self.ssh_port)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `explicit` if given, else the first default path found, else defaults
    ///
    /// Nothing is logged here: this runs before the subscriber is installed,
    /// so the caller reports the returned source once logging is up.
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be read or parsed
    pub fn resolve(explicit: Option<&Path>) -> eyre::Result<(Self, ConfigSource)> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path(),
        };

        match path {
            Some(path) => {
                let config = Self::load(&path)
                    .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
                Ok((config, ConfigSource::File(path)))
            }
            None => Ok((Config::default(), ConfigSource::Defaults)),
        }
    }

    fn default_path() -> Option<PathBuf> {
        // Check environment variable
        if let Ok(path) = std::env::var("HOSTRUN_CONFIG") {
            return Some(PathBuf::from(path));
        }

        // Try common paths
        let paths = [
            Some(PathBuf::from("hostrun.toml")),
            Some(PathBuf::from("/etc/hostrun/hostrun.toml")),
            dirs::config_dir().map(|p| p.join("hostrun/hostrun.toml")),
        ];

        paths.into_iter().flatten().find(|path| path.is_file())
    }

    /// Look up a named host
    #[must_use]
    pub fn find_host(&self, name: &str) -> Option<&HostEntry> {
        self.host.iter().find(|h| h.name == name)
    }
}
