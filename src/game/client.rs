use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::round::{Choice, Verdict};
use crate::network::{
    AnnouncementListener, ClientEvent, ConnectionClient, DiscoveredLobby, DiscoveryError, SessionMessage, WireRecord,
};

/// Notifications for the player's presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    LobbyFound(DiscoveredLobby),
    Joined(SocketAddr),
    Left,
    /// The host started a round; the player should pick a move
    ChoiceRequested,
    RoundFinished(Verdict),
    Error(String),
}

/// Raw input waiting to be applied by [`LobbyClient::handle_event`]
#[derive(Debug)]
pub enum ClientInput {
    Lobby(DiscoveredLobby),
    Connection(ClientEvent),
}

/// Player side of a session: find a lobby, join it and play rounds
#[derive(Debug)]
pub struct LobbyClient {
    listener: AnnouncementListener,
    lobbies: Option<mpsc::UnboundedReceiver<DiscoveredLobby>>,
    connection: ConnectionClient,
    connection_rx: mpsc::UnboundedReceiver<ClientEvent>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    closed: bool,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl LobbyClient {
    pub fn new(discovery_port: u16) -> (Self, mpsc::UnboundedReceiver<PlayerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (connection, connection_rx) = ConnectionClient::new();
        let client = Self {
            listener: AnnouncementListener::new(discovery_port),
            lobbies: None,
            connection,
            connection_rx,
            events: tx,
            closed: false,
        };
        (client, rx)
    }

    /// Start listening for lobby announcements. The first lobby with a free
    /// seat is joined automatically.
    pub fn search(&mut self) -> Result<(), DiscoveryError> {
        if self.listener.is_running() || self.connection.is_connected() {
            return Ok(());
        }

        match self.listener.start() {
            Ok(rx) => {
                self.lobbies = Some(rx);
                self.closed = false;
                Ok(())
            }
            Err(e) => {
                error!("Failed to search for lobbies: {}", e);
                self.emit(PlayerEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    pub fn is_searching(&self) -> bool {
        self.listener.is_running()
    }

    /// Address the announcement listener is bound to
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.connection.peer_addr()
    }

    /// Connect straight to a session, skipping discovery
    pub async fn join(&mut self, addr: SocketAddr) {
        self.closed = false;
        self.connection.connect(addr).await;
    }

    /// Send a move for the running round. False when not connected.
    pub fn submit_choice(&self, choice: Choice) -> bool {
        match SessionMessage::Choice(choice.number()).encode() {
            Ok(frame) => self.connection.send_message(Bytes::from(frame)),
            Err(e) => {
                error!("Failed to encode choice: {}", e);
                false
            }
        }
    }

    /// Wait for the next input. Cancel-safe; returns `None` after `close`.
    pub async fn next_event(&mut self) -> Option<ClientInput> {
        if self.closed {
            return None;
        }

        tokio::select! {
            Some(lobby) = recv_opt(&mut self.lobbies) => Some(ClientInput::Lobby(lobby)),
            event = self.connection_rx.recv() => event.map(ClientInput::Connection),
        }
    }

    /// Wait for and apply one input. Returns false once closed.
    pub async fn process_next(&mut self) -> bool {
        match self.next_event().await {
            Some(input) => {
                self.handle_event(input).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle_event(&mut self, input: ClientInput) {
        match input {
            ClientInput::Lobby(found) => self.on_lobby_found(found).await,
            ClientInput::Connection(event) => self.on_connection_event(event),
        }
    }

    /// Stop searching and leave the session
    pub fn close(&mut self) {
        self.stop_search();
        self.connection.disconnect_from_server();
        self.closed = true;
    }

    fn stop_search(&mut self) {
        self.listener.stop();
        self.lobbies = None;
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    async fn on_lobby_found(&mut self, found: DiscoveredLobby) {
        if self.connection.is_connected() {
            return;
        }

        let addr = found.session_addr();
        let has_room = found.descriptor.has_room();
        info!(
            "Found lobby '{}' at {} ({}/{})",
            found.descriptor.name, addr, found.descriptor.current_players, found.descriptor.max_players
        );
        self.emit(PlayerEvent::LobbyFound(found));

        if has_room {
            self.connection.connect(addr).await;
        } else {
            debug!("Lobby at {} is full, waiting", addr);
        }
    }

    fn on_connection_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected(addr) => {
                self.stop_search();
                self.emit(PlayerEvent::Joined(addr));
            }
            ClientEvent::Disconnected => self.emit(PlayerEvent::Left),
            ClientEvent::ConnectionError(reason) => self.emit(PlayerEvent::Error(reason)),
            ClientEvent::MessageReceived(frame) => match SessionMessage::decode(&frame) {
                Ok(SessionMessage::RoundStart) => self.emit(PlayerEvent::ChoiceRequested),
                Ok(SessionMessage::RoundResult(verdict)) => {
                    info!("Round finished: {}", verdict);
                    self.emit(PlayerEvent::RoundFinished(verdict));
                }
                Ok(other) => debug!("Ignoring {} from host", other),
                Err(e) => debug!("Dropping malformed message from host: {}", e),
            },
        }
    }
}
