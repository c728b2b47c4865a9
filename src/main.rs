use anyhow::Result;
use clap::Parser;
use kubeboot::commands::{self, ClusterCommands};
use kubeboot::config_manager;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kubeboot")]
#[command(about = "Bootstrap a kubeadm control plane or worker on a prepared Debian host", long_about = None)]
struct Cli {
    /// Settings file (default: ~/.config/kubeboot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: ClusterCommands,
}

fn main() -> Result<()> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let settings = config_manager::load_settings(cli.config.as_deref())?;
    commands::handle_cluster(settings, cli.command)
}
