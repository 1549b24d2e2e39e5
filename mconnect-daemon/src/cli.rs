//! Command-line interface and logging setup

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// mconnect command-line interface
#[derive(Parser, Debug)]
#[command(name = "mconnect")]
#[command(about = "KDE Connect compatible discovery and pairing", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log at debug level, same as `--log-level debug`
    #[arg(long, global = true)]
    pub debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Configuration file to use instead of the default location
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Announce this device, track peers and accept connections (default)
    Daemon,

    /// Print each device seen on the network
    Discover,

    /// Connect to a device
    Connect {
        /// Address of the device, `host:port`
        #[arg(short, long)]
        address: String,

        /// Ask the device to pair once connected
        #[arg(long)]
        pair: bool,
    },
}

impl Cli {
    /// Subcommand to run, `daemon` when none was given
    pub fn selected_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Daemon)
    }
}

/// Level used when `RUST_LOG` is not set
fn effective_log_level(cli: &Cli, config_debug: bool) -> Result<Level> {
    if cli.debug || config_debug {
        return Ok(Level::DEBUG);
    }

    cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })
}

/// Initialize logging based on CLI flags and the config's debug switch
///
/// Logs go to stderr so `discover` output on stdout stays clean.
pub fn init_logging(cli: &Cli, config_debug: bool) -> Result<()> {
    let log_level = effective_log_level(cli, config_debug)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if cli.json_logs {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

    debug!(
        "Logging initialized: level={}, json={}",
        log_level, cli.json_logs
    );
    Ok(())
}
