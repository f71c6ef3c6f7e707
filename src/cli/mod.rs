use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing::Level;

use crate::network::{DEFAULT_DISCOVERY_PORT, DEFAULT_TCP_PORT};

pub mod commands;
pub mod menu;
pub mod ui;

pub use commands::handle_command;
pub use menu::InteractiveMenu;

#[derive(Parser)]
#[command(author, version, about = "Rock, paper, scissors over the local network", long_about = None)]
pub struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: Level,

    /// UDP port lobby announcements are sent to
    #[arg(long, global = true, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Host a lobby and play from this terminal
    Host {
        /// Name announced to other players
        #[arg(long, default_value = "LAN Lobby")]
        name: String,
        /// Lobby capacity, host included
        #[arg(long, default_value_t = 2)]
        players: u32,
        /// TCP port players connect to
        #[arg(long, default_value_t = DEFAULT_TCP_PORT)]
        port: u16,
        /// Your display name
        #[arg(long, default_value = "Host")]
        host_name: String,
    },
    /// Search the network and join the first lobby with a free seat
    Join {
        /// Skip discovery and connect to this address
        #[arg(long)]
        address: Option<SocketAddr>,
    },
    /// Launch interactive menu
    Interactive,
}
