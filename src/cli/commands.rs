use anyhow::Result;

use crate::cli::Commands;
use crate::cli::ui::{run_host, run_player};
use crate::network::SessionConfig;

/// Build the hosted session's configuration from the `host` flags
pub fn host_config(command: &Commands, discovery_port: u16) -> Option<SessionConfig> {
    match command {
        Commands::Host {
            name,
            players,
            port,
            host_name,
        } => Some(SessionConfig {
            lobby_name: name.clone(),
            max_players: *players,
            tcp_port: *port,
            discovery_port,
            host_name: host_name.clone(),
        }),
        _ => None,
    }
}

pub async fn handle_command(command: Commands, discovery_port: u16) -> Result<()> {
    if let Some(config) = host_config(&command, discovery_port) {
        config.validate()?;
        return run_host(config).await;
    }

    match command {
        Commands::Join { address } => run_player(discovery_port, address).await?,
        Commands::Host { .. } | Commands::Interactive => {
            // Interactive is resolved into Host or Join in main.rs
        }
    }

    Ok(())
}
