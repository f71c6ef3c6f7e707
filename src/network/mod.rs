mod client;
mod connection;
mod discovery;
mod protocol;
mod socket;

pub use client::{ClientEvent, ConnectionClient};
pub use connection::{ConnectionError, ConnectionServer, ServerEvent};
pub use discovery::{AnnouncementBroadcaster, AnnouncementListener, DiscoveredLobby, DiscoveryError};
pub use protocol::{HOST_PLAYER_ID, LobbyDescriptor, PlayerId, PlayerRecord, SessionMessage, WireRecord};

use thiserror::Error;

/// Default TCP port of the session channel
pub const DEFAULT_TCP_PORT: u16 = 45678;
/// Default UDP port for lobby announcements
pub const DEFAULT_DISCOVERY_PORT: u16 = 45679;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("A lobby needs room for at least one player")]
    NoCapacity,

    #[error("Lobby name must not be empty")]
    EmptyLobbyName,
}

/// Configuration for a hosted session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Name announced to other players
    pub lobby_name: String,
    /// Capacity of the lobby, host included
    pub max_players: u32,
    /// The port to listen on for player connections (0 picks a free port)
    pub tcp_port: u16,
    /// The port lobby announcements are sent to
    pub discovery_port: u16,
    /// Display name of the hosting player
    pub host_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lobby_name: "LAN Lobby".to_string(),
            max_players: 2,
            tcp_port: DEFAULT_TCP_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            host_name: "Host".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_players == 0 {
            return Err(ConfigError::NoCapacity);
        }
        if self.lobby_name.trim().is_empty() {
            return Err(ConfigError::EmptyLobbyName);
        }
        Ok(())
    }
}
