use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::round::{Choice, Move, RoundOutcome, RoundResolver, Verdict};
use crate::network::{
    AnnouncementBroadcaster, ConfigError, ConnectionError, ConnectionServer, HOST_PLAYER_ID, LobbyDescriptor, PlayerId,
    PlayerRecord, ServerEvent, SessionConfig, SessionMessage, WireRecord,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start connection server: {0}")]
    Server(#[from] ConnectionError),

    #[error("Operation not allowed while {0}")]
    InvalidState(SessionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Full,
    RoundInProgress,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Listening => write!(f, "Listening"),
            SessionState::Full => write!(f, "Full"),
            SessionState::RoundInProgress => write!(f, "RoundInProgress"),
            SessionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Notifications for the host's presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    PlayerJoined(PlayerRecord),
    PlayerLeft(PlayerRecord),
    /// A round began; the host should pick a move
    RoundStarted,
    /// Every member moved; `host_verdict` is the host's own result
    RoundResolved {
        outcomes: Vec<RoundOutcome>,
        host_verdict: Verdict,
    },
}

/// One hosted lobby, from `start_server` to `close`.
///
/// Owns the connection server, the announcement broadcaster, the member list
/// and the round resolver. The server only reports [`ServerEvent`]s; who is in
/// the lobby and when a round runs is decided here.
#[derive(Debug)]
pub struct LobbySession {
    config: SessionConfig,
    state: SessionState,
    descriptor: LobbyDescriptor,
    players: Vec<PlayerRecord>,
    resolver: RoundResolver,
    server: ConnectionServer,
    broadcaster: AnnouncementBroadcaster,
    server_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl LobbySession {
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let broadcaster = AnnouncementBroadcaster::new(config.discovery_port);
        Self::with_broadcaster(config, broadcaster)
    }

    /// Build a session around a preconfigured broadcaster
    pub fn with_broadcaster(
        config: SessionConfig,
        broadcaster: AnnouncementBroadcaster,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let descriptor = LobbyDescriptor::new(config.lobby_name.clone(), config.max_players, config.tcp_port);
        let session = Self {
            config,
            state: SessionState::Idle,
            descriptor,
            players: Vec::new(),
            resolver: RoundResolver::new(),
            server: ConnectionServer::new(),
            broadcaster,
            server_rx: None,
            events: tx,
        };
        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> &LobbyDescriptor {
        &self.descriptor
    }

    pub fn players(&self) -> &[PlayerRecord] {
        &self.players
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Moves recorded so far in the current round
    pub fn pending_moves(&self) -> usize {
        self.resolver.len()
    }

    /// Open the lobby: start the connection server, register the host and
    /// begin announcing. A bind failure leaves the session Idle.
    pub async fn start_server(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState(self.state));
        }
        self.config.validate()?;

        let server_rx = self.server.start(self.config.tcp_port).await?;
        let local_addr = self
            .server
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.config.tcp_port)));
        self.server_rx = Some(server_rx);
        self.descriptor.tcp_port = local_addr.port();

        let host = PlayerRecord::host(self.config.host_name.clone(), local_addr);
        info!("Hosting lobby '{}' on {} as {}", self.config.lobby_name, local_addr, host.display_name);
        self.players.push(host);
        self.descriptor.current_players = self.player_count();

        self.set_state(SessionState::Listening);
        if let Err(e) = self.broadcaster.start(self.descriptor.clone()) {
            error!("Lobby broadcast unavailable: {}", e);
        }

        self.refresh_lobby();
        Ok(())
    }

    /// Wait for the next connection server event. Cancel-safe; returns
    /// `None` once the session is not running.
    pub async fn next_server_event(&mut self) -> Option<ServerEvent> {
        match self.server_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Wait for and apply one server event. Returns false when the session has stopped.
    pub async fn process_next(&mut self) -> bool {
        match self.next_server_event().await {
            Some(event) => {
                self.handle_server_event(event);
                true
            }
            None => false,
        }
    }

    pub fn handle_server_event(&mut self, event: ServerEvent) {
        if matches!(self.state, SessionState::Idle | SessionState::Closed) {
            debug!("Ignoring {:?} while {}", event, self.state);
            return;
        }

        match event {
            ServerEvent::PlayerConnected(record) => self.on_player_connected(record),
            ServerEvent::PlayerDisconnected(record) => self.on_player_disconnected(record),
            ServerEvent::MessageReceived(player_id, payload) => self.on_message_received(player_id, &payload),
        }
    }

    /// The host's own move for the running round
    pub fn submit_host_choice(&mut self, choice: Choice) -> Result<(), SessionError> {
        if self.state != SessionState::RoundInProgress {
            return Err(SessionError::InvalidState(self.state));
        }
        debug!("Host chose {}", choice);
        self.resolver.record(Move {
            player_id: HOST_PLAYER_ID,
            choice,
        });
        self.try_resolve_round();
        Ok(())
    }

    /// Leave a finished round: drop any pending moves and re-run the
    /// capacity transitions, which starts a new round if the lobby is still full.
    pub fn next_round(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::RoundInProgress {
            return Err(SessionError::InvalidState(self.state));
        }
        self.resolver.reset();
        self.set_state(SessionState::Full);
        self.refresh_lobby();
        Ok(())
    }

    /// Tear the session down: broadcaster, then server, then membership.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        self.broadcaster.stop();
        self.server.stop().await;
        self.server_rx = None;
        self.players.clear();
        self.resolver.reset();
        self.descriptor.current_players = 0;

        info!("Lobby '{}' closed", self.config.lobby_name);
        self.set_state(SessionState::Closed);
    }

    fn player_count(&self) -> u32 {
        u32::try_from(self.players.len()).unwrap_or(u32::MAX)
    }

    fn capacity(&self) -> usize {
        self.config.max_players as usize
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Lobby state {} -> {}", self.state, state);
            self.state = state;
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }

    fn on_player_connected(&mut self, record: PlayerRecord) {
        if self.players.len() >= self.capacity() {
            warn!("Lobby full, rejecting {} (ID: {})", record.address, record.stable_id);
            self.server.disconnect(record.stable_id);
            return;
        }

        if self.players.iter().any(|p| p.same_identity(&record)) {
            warn!("{} is already in the lobby, rejecting (ID: {})", record.address.ip(), record.stable_id);
            self.server.disconnect(record.stable_id);
            return;
        }

        info!("{} joined from {} (ID: {})", record.display_name, record.address, record.stable_id);
        self.players.push(record.clone());
        let _ = self.events.send(SessionEvent::PlayerJoined(record));
        self.refresh_lobby();
    }

    fn on_player_disconnected(&mut self, record: PlayerRecord) {
        // Ids are unique per connection; a rejected duplicate shares its IP with a member
        let Some(index) = self
            .players
            .iter()
            .position(|p| !p.is_host && p.stable_id == record.stable_id)
        else {
            debug!("Ignoring disconnect of non-member {} (ID: {})", record.address, record.stable_id);
            return;
        };

        let gone = self.players.remove(index);
        if self.resolver.withdraw(gone.stable_id) {
            debug!("Withdrew pending move of {}", gone.display_name);
        }
        info!("{} left the lobby (ID: {})", gone.display_name, gone.stable_id);
        let _ = self.events.send(SessionEvent::PlayerLeft(gone));
        self.refresh_lobby();
    }

    fn on_message_received(&mut self, player_id: PlayerId, payload: &[u8]) {
        let message = match SessionMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed message from player {}: {}", player_id, e);
                return;
            }
        };

        let SessionMessage::Choice(number) = message else {
            debug!("Ignoring {} from player {}", message, player_id);
            return;
        };

        if self.state != SessionState::RoundInProgress {
            debug!("Ignoring choice from player {} while {}", player_id, self.state);
            return;
        }
        if !self.players.iter().any(|p| p.stable_id == player_id) {
            debug!("Ignoring choice from non-member {}", player_id);
            return;
        }

        match Choice::try_from(number) {
            Ok(choice) => {
                if self.resolver.has_move(player_id) {
                    debug!("Player {} changed their move to {}", player_id, choice);
                } else {
                    debug!("Player {} chose {}", player_id, choice);
                }
                self.resolver.record(Move { player_id, choice });
                self.try_resolve_round();
            }
            Err(e) => debug!("Dropping choice from player {}: {}", player_id, e),
        }
    }

    /// Recompute the descriptor and apply the capacity transitions
    fn refresh_lobby(&mut self) {
        self.descriptor.current_players = self.player_count();
        self.broadcaster.update(self.descriptor.clone());

        let members = self.players.len();
        let capacity = self.capacity();

        if members >= capacity {
            if self.state == SessionState::Listening {
                self.pause_lobby_search();
                self.set_state(SessionState::Full);
            }
            if self.state == SessionState::Full && members == capacity {
                self.start_round();
            }
        } else if matches!(self.state, SessionState::Full | SessionState::RoundInProgress) {
            if self.state == SessionState::RoundInProgress && !self.resolver.is_empty() {
                info!("Round abandoned, {} of {} players remain", members, capacity);
            }
            self.resolver.reset();
            self.resume_lobby_search();
            self.set_state(SessionState::Listening);
        }
    }

    fn pause_lobby_search(&mut self) {
        self.server.set_accepting_new_connections(false);
        self.broadcaster.stop();
    }

    fn resume_lobby_search(&mut self) {
        self.server.set_accepting_new_connections(true);
        if let Err(e) = self.broadcaster.start(self.descriptor.clone()) {
            error!("Failed to restart lobby broadcast: {}", e);
        }
    }

    fn start_round(&mut self) {
        self.resolver.reset();
        self.set_state(SessionState::RoundInProgress);

        // Only members hear about the round; a rejected connection may still be
        // registered with the server until its event is handled.
        let frame = match SessionMessage::RoundStart.encode() {
            Ok(frame) => Bytes::from(frame),
            Err(e) => {
                error!("Failed to encode round start: {}", e);
                return;
            }
        };
        for player in &self.players {
            info!("Round player: {} @ {}", player.display_name, player.address);
            if !player.is_host && !self.server.send_to_player(player.stable_id, frame.clone()) {
                warn!("Could not deliver round start to {}", player.display_name);
            }
        }
        let _ = self.events.send(SessionEvent::RoundStarted);
    }

    fn try_resolve_round(&mut self) {
        if !self.resolver.is_complete(self.players.len()) {
            return;
        }

        let outcomes = self.resolver.resolve();
        let mut host_verdict = Verdict::Draw;
        for outcome in &outcomes {
            if outcome.player_id == HOST_PLAYER_ID {
                host_verdict = outcome.verdict;
                continue;
            }
            match SessionMessage::RoundResult(outcome.verdict).encode() {
                Ok(frame) => {
                    if !self.server.send_to_player(outcome.player_id, Bytes::from(frame)) {
                        warn!("Could not deliver result to player {}", outcome.player_id);
                    }
                }
                Err(e) => error!("Failed to encode round result: {}", e),
            }
        }

        info!("Round resolved: {:?}", outcomes);
        let _ = self.events.send(SessionEvent::RoundResolved { outcomes, host_verdict });
    }
}
