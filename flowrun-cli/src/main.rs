//! flowrun
//!
//! Runs pipeline declarations locally with dependency-aware, bounded-parallel
//! scheduling.

mod commands;
mod output;

use clap::Parser;
use color_eyre::Result;
use commands::Commands;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowrun")]
#[command(version, about = "Run CI pipeline declarations locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    commands::handle_command(cli.command).await
}
