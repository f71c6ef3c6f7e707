mod cli;
mod game;
mod network;
mod utils;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use cli::{Cli, Commands, InteractiveMenu, handle_command};
use utils::setup_logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level).map_err(|e| anyhow::anyhow!("Logging setup failed: {}", e))?;
    info!("Starting lan-rps...");

    let command = match cli.command {
        Commands::Interactive => match InteractiveMenu::new().run()? {
            Some(command) => command,
            None => return Ok(()),
        },
        command => command,
    };

    handle_command(command, cli.discovery_port).await
}
