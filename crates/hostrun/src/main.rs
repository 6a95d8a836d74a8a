//! hostrun CLI
//!
//! Runs a shell command on this machine with retry, or on a remote host over SSH

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use eyre::{bail, eyre};
use hostrun_exec::{
    CommandResult, ExecError, HostTarget, LocalRetryRunner, RemoteFailure, RemoteSessionRunner,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, HostEntry};

#[derive(Parser)]
#[command(name = "hostrun", version)]
#[command(about = "Run shell commands locally with retry or remotely over SSH", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print the result as JSON and log in JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command locally, retrying until it exits zero
    #[command(name = "local")]
    Local {
        /// Total attempts
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Seconds to wait between attempts
        #[arg(long)]
        wait: Option<u64>,

        /// Shell to run the command with
        #[arg(long)]
        shell: Option<String>,

        /// Command to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },

    /// Run a command on a remote host over SSH
    #[command(name = "remote")]
    Remote {
        #[command(flatten)]
        target: TargetArgs,

        /// Upper bound in seconds on each wait for channel activity
        #[arg(long)]
        timeout: Option<u64>,

        /// Connection attempts
        #[arg(long)]
        connect_attempts: Option<u32>,

        /// Seconds to wait between connection attempts
        #[arg(long)]
        connect_wait: Option<u64>,

        /// Command to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Named host from the config file
    #[arg(short, long, conflicts_with_all = ["host", "user", "key", "port"])]
    target: Option<String>,

    /// Host address
    #[arg(long)]
    host: Option<String>,

    /// SSH user (defaults to root)
    #[arg(long)]
    user: Option<String>,

    /// Private key path, or env:NAME for a base64 key
    #[arg(long)]
    key: Option<String>,

    /// SSH port (defaults to 22)
    #[arg(long)]
    port: Option<u16>,
}

impl TargetArgs {
    fn resolve(&self, config: &Config) -> Result<HostTarget> {
        if let Some(name) = &self.target {
            return config
                .find_host(name)
                .map(HostEntry::target)
                .ok_or_else(|| eyre!("unknown target `{name}`"));
        }

        let (Some(host), Some(key)) = (&self.host, &self.key) else {
            bail!("either --target or both --host and --key are required");
        };

        Ok(
            HostTarget::new(host, self.user.as_deref().unwrap_or("root"), key)
                .with_port(self.port.unwrap_or(22)),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let cli = Cli::parse();

    // The log level may come from the config, so load it before tracing is up
    let (config, source) = Config::resolve(cli.config.as_deref())?;

    init_tracing(
        cli.log_level.as_deref().unwrap_or(&config.settings.log_level),
        cli.json,
    );
    debug!(source = %source, "configuration loaded");

    match cli.command {
        Commands::Local {
            max_attempts,
            wait,
            shell,
            cmd,
        } => {
            let mut policy = config.local.policy();
            if let Some(n) = max_attempts {
                policy.max_attempts = n;
            }
            if let Some(secs) = wait {
                policy.wait_period = Duration::from_secs(secs);
            }

            let runner = LocalRetryRunner::new(policy)
                .with_shell(shell.unwrap_or_else(|| config.local.shell.clone()));
            let result = runner.run(&cmd.join(" ")).await?;
            report(&result, cli.json, false)
        }
        Commands::Remote {
            target,
            timeout,
            connect_attempts,
            connect_wait,
            cmd,
        } => {
            let target = target.resolve(&config)?;

            let mut options = config.remote.options();
            if let Some(secs) = timeout {
                options.timeout = Duration::from_secs(secs);
            }
            if let Some(n) = connect_attempts {
                options.connect_retry.max_attempts = n;
            }
            if let Some(secs) = connect_wait {
                options.connect_retry.wait_period = Duration::from_secs(secs);
            }
            // Stream output live unless stdout is reserved for JSON
            options.echo = !cli.json;

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling");
                    trigger.cancel();
                }
            });

            info!(target_host = %target, "running remote command");
            let runner = RemoteSessionRunner::ssh(options);
            let result = match runner
                .run_cancellable(&target, &cmd.join(" "), &cancel)
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    if cli.json {
                        if let Some(failure) = failure_json(&e) {
                            println!("{}", serde_json::to_string_pretty(&failure)?);
                        }
                    }
                    return Err(e.into());
                }
            };
            report(&result, cli.json, true)
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn report(result: &CommandResult, json: bool, echoed: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if !echoed {
        print!("{}", result.stdout());
    }
    Ok(())
}

/// Output carried by a non-zero remote exit, which echo did not show
fn failure_json(err: &ExecError) -> Option<serde_json::Value> {
    match err {
        ExecError::RemoteExecutionFailed(RemoteFailure::NonZeroExit {
            status,
            stdout_chunks,
        }) => Some(serde_json::json!({
            "exit_status": status,
            "stdout_chunks": stdout_chunks,
        })),
        _ => None,
    }
}
