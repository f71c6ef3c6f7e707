pub mod client;
pub mod lobby;
pub mod round;

pub use client::{LobbyClient, PlayerEvent};
pub use lobby::{LobbySession, SessionEvent, SessionState};
pub use round::{Choice, Verdict};
