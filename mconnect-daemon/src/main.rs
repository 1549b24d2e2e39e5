mod cli;
mod config;
mod daemon;
mod registry;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use config::Config;
use daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli::init_logging(&cli, config.main.debug)?;

    info!("Starting mconnect {}", env!("CARGO_PKG_VERSION"));

    let daemon = Daemon::new(config).context("Failed to create daemon")?;
    let cancel = daemon::shutdown_signal();

    match cli.selected_command() {
        Command::Daemon => daemon.run(cancel).await,
        Command::Discover => daemon.discover(cancel).await,
        Command::Connect { address, pair } => daemon.connect(&address, pair, cancel).await,
    }
}
