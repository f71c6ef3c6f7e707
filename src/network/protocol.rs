use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::game::round::Verdict;

/// Largest payload the codec will produce or accept (fits a single UDP datagram)
pub const MAX_PAYLOAD_SIZE: usize = 1400;

/// Stable identifier of a player inside one session
pub type PlayerId = u64;

/// Id reserved for the hosting player
pub const HOST_PLAYER_ID: PlayerId = 0;

/// Error types for codec operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    Decode(#[from] bincode::Error),

    #[error("Lobby descriptor reports {current} players but only allows {max}")]
    InvalidDescriptor { current: u32, max: u32 },
}

/// Little endian, fixed-width integers, bounded size, trailing bytes rejected.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PAYLOAD_SIZE as u64)
}

/// A record that travels over the network with a fixed field order
pub trait WireRecord: Serialize + DeserializeOwned {
    /// Encode the record to bytes
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(wire_options().serialize(self)?)
    }

    /// Decode bytes to a record. Truncated or malformed input is an error, never a panic.
    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let record: Self = wire_options().deserialize(data)?;
        record.validate()?;
        Ok(record)
    }

    /// Semantic checks run after a successful structural decode
    fn validate(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Lobby information announced over UDP
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyDescriptor {
    /// Name of the lobby
    pub name: String,
    /// Maximum number of players, host included
    pub max_players: u32,
    /// Players currently in the lobby, host included
    pub current_players: u32,
    /// TCP port of the session channel
    pub tcp_port: u16,
    /// Sender of the announcement. Filled in by the receiver, never encoded.
    #[serde(skip)]
    pub origin_address: Option<IpAddr>,
}

impl LobbyDescriptor {
    pub fn new(name: impl Into<String>, max_players: u32, tcp_port: u16) -> Self {
        Self {
            name: name.into(),
            max_players,
            current_players: 0,
            tcp_port,
            origin_address: None,
        }
    }

    pub fn has_room(&self) -> bool {
        self.current_players < self.max_players
    }
}

impl WireRecord for LobbyDescriptor {
    fn validate(&self) -> Result<(), ProtocolError> {
        if self.current_players > self.max_players {
            return Err(ProtocolError::InvalidDescriptor {
                current: self.current_players,
                max: self.max_players,
            });
        }
        Ok(())
    }
}

/// A member of a lobby
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Display name; may collide between players
    pub display_name: String,
    /// Transport address. Its IP is the player's identity within a lobby.
    pub address: SocketAddr,
    /// Whether this record is the hosting player
    pub is_host: bool,
    /// Id assigned when the record was created
    pub stable_id: PlayerId,
}

impl PlayerRecord {
    /// The hosting player's own record
    pub fn host(display_name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            display_name: display_name.into(),
            address,
            is_host: true,
            stable_id: HOST_PLAYER_ID,
        }
    }

    /// Record for an accepted remote connection, named after its peer address
    pub fn remote(stable_id: PlayerId, address: SocketAddr) -> Self {
        let ip = address.ip().to_string();
        let tail_start = ip.len().saturating_sub(5);
        Self {
            display_name: format!("Player_{}", &ip[tail_start..]),
            address,
            is_host: false,
            stable_id,
        }
    }

    /// Whether both records come from the same machine
    pub fn same_identity(&self, other: &PlayerRecord) -> bool {
        self.address.ip() == other.address.ip()
    }
}

impl WireRecord for PlayerRecord {}

/// Messages carried by the session channel, one per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Client -> server: the player's move, 1..=3
    Choice(u8),
    /// Server -> client: a round begins
    RoundStart,
    /// Server -> client: the receiving player's outcome
    RoundResult(Verdict),
}

impl WireRecord for SessionMessage {}

impl fmt::Display for SessionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMessage::Choice(n) => write!(f, "Choice({})", n),
            SessionMessage::RoundStart => write!(f, "RoundStart"),
            SessionMessage::RoundResult(verdict) => write!(f, "RoundResult({})", verdict),
        }
    }
}
