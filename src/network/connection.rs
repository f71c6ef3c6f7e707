use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use super::protocol::{HOST_PLAYER_ID, PlayerId, PlayerRecord};
use super::socket::{self, SocketError};

/// Largest frame accepted on the session channel
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Socket error: {0}")]
    SocketError(#[from] SocketError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Server already running on {0}")]
    AlreadyRunning(SocketAddr),
}

/// Events raised by the connection server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted and registered
    PlayerConnected(PlayerRecord),
    /// A registered connection went away, raised once per connection
    PlayerDisconnected(PlayerRecord),
    /// A frame arrived from a registered connection
    MessageReceived(PlayerId, Bytes),
}

fn session_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// A length-prefixed framed TCP connection driven by a reader and a writer task.
///
/// The close notification fires at most once, either from the reader when the
/// peer goes away or from [`PeerLink::close`].
#[derive(Debug)]
pub(crate) struct PeerLink {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl PeerLink {
    pub(crate) fn spawn<F, C>(stream: TcpStream, addr: SocketAddr, mut on_frame: F, on_close: C) -> Self
    where
        F: FnMut(Bytes) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let alive = Arc::new(AtomicBool::new(true));

        // Writer drains queued frames, then shuts the write half down
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, session_codec());
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!("Failed to write frame to {}: {}", addr, e);
                    return;
                }
            }
            if let Err(e) = SinkExt::<Bytes>::close(&mut sink).await {
                debug!("Failed to close connection to {}: {}", addr, e);
            }
            debug!("Outgoing frame handler for {} exited", addr);
        });

        let reader_alive = Arc::clone(&alive);
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, session_codec());
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(frame) => on_frame(frame.freeze()),
                    Err(e) => {
                        warn!("Dropping connection to {}: {}", addr, e);
                        break;
                    }
                }
            }
            debug!("Connection to {} closed by peer", addr);
            if reader_alive.swap(false, Ordering::SeqCst) {
                on_close();
            }
        });

        Self {
            addr,
            outbound: tx,
            alive,
            reader,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue a frame; false when the writer is gone
    pub(crate) fn send(&self, frame: Bytes) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Close locally. Queued frames are still flushed by the writer.
    /// Returns true when this call, not the peer, ended the connection.
    pub(crate) fn close(self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.reader.abort();
        was_alive
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

type ConnectionTable = Arc<Mutex<HashMap<PlayerId, (PlayerRecord, PeerLink)>>>;

fn lock(table: &ConnectionTable) -> MutexGuard<'_, HashMap<PlayerId, (PlayerRecord, PeerLink)>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Accepts player connections and relays their frames as [`ServerEvent`]s
#[derive(Debug)]
pub struct ConnectionServer {
    connections: ConnectionTable,
    accepting: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Default for ConnectionServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionServer {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            accepting: Arc::new(AtomicBool::new(true)),
            next_id: Arc::new(AtomicU64::new(HOST_PLAYER_ID + 1)),
            events: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Bind `port` (0 for an ephemeral port) and start accepting players
    pub async fn start(&mut self, port: u16) -> Result<mpsc::UnboundedReceiver<ServerEvent>, ConnectionError> {
        if let Some(addr) = self.local_addr {
            return Err(ConnectionError::AlreadyRunning(addr));
        }

        let listener = socket::bind_session_listener(port)?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        self.accepting.store(true, Ordering::SeqCst);
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.connections),
            Arc::clone(&self.accepting),
            Arc::clone(&self.next_id),
            tx.clone(),
        )));
        self.events = Some(tx);
        self.local_addr = Some(local_addr);

        info!("Connection server listening on {}", local_addr);
        Ok(rx)
    }

    /// Stop listening and drop every connection. The port is free when this returns.
    pub async fn stop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);

        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }

        let drained: Vec<(PlayerRecord, PeerLink)> = lock(&self.connections).drain().map(|(_, entry)| entry).collect();
        for (record, link) in drained {
            if link.close() {
                self.emit(ServerEvent::PlayerDisconnected(record));
            }
        }

        self.events = None;
        if let Some(addr) = self.local_addr.take() {
            info!("Connection server on {} stopped", addr);
        }
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn set_accepting_new_connections(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
        debug!("Accepting new connections: {}", accepting);
    }

    pub fn is_accepting_new_connections(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Close a player's connection. Returns false for unknown ids.
    pub fn disconnect(&self, player_id: PlayerId) -> bool {
        let entry = lock(&self.connections).remove(&player_id);
        match entry {
            Some((record, link)) => {
                info!("Disconnecting {} (ID: {})", record.address, player_id);
                if link.close() {
                    self.emit(ServerEvent::PlayerDisconnected(record));
                }
                true
            }
            None => false,
        }
    }

    pub fn send_to_all(&self, payload: Bytes) {
        for (record, link) in lock(&self.connections).values() {
            if !link.send(payload.clone()) {
                debug!("Dropped frame for {} (ID: {})", link.addr(), record.stable_id);
            }
        }
    }

    /// Queue a frame for one player. Returns false for unknown ids.
    pub fn send_to_player(&self, player_id: PlayerId, payload: Bytes) -> bool {
        match lock(&self.connections).get(&player_id) {
            Some((_, link)) => link.send(payload),
            None => false,
        }
    }

    fn emit(&self, event: ServerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl Drop for ConnectionServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        lock(&self.connections).clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: ConnectionTable,
    accepting: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
                continue;
            }
        };

        if !accepting.load(Ordering::SeqCst) {
            info!("Refusing connection from {}: not accepting new players", addr);
            drop(stream);
            continue;
        }

        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let record = PlayerRecord::remote(id, addr);
        debug!("Handling new TCP connection from {} (ID: {})", addr, id);

        // Register and announce under the table lock so the connect event is
        // queued before anything the reader task can raise.
        let mut table = connections.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = events.send(ServerEvent::PlayerConnected(record.clone()));

        let frame_events = events.clone();
        let close_events = events.clone();
        let close_table = Arc::clone(&connections);
        let close_record = record.clone();
        let link = PeerLink::spawn(
            stream,
            addr,
            move |frame| {
                let _ = frame_events.send(ServerEvent::MessageReceived(id, frame));
            },
            move || {
                lock(&close_table).remove(&id);
                info!("Player {} (ID: {}) disconnected", close_record.address, id);
                let _ = close_events.send(ServerEvent::PlayerDisconnected(close_record));
            },
        );
        table.insert(id, (record, link));
        drop(table);

        info!("Connection established with {} (ID: {})", addr, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(WAIT, rx.recv()).await.expect("timed out").expect("channel closed")
    }

    async fn framed_client(addr: SocketAddr) -> (FramedRead<tokio::net::tcp::OwnedReadHalf, LengthDelimitedCodec>, FramedWrite<tokio::net::tcp::OwnedWriteHalf, LengthDelimitedCodec>) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, w) = stream.into_split();
        (FramedRead::new(r, session_codec()), FramedWrite::new(w, session_codec()))
    }

    fn loopback(server: &ConnectionServer) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], server.local_addr().unwrap().port()))
    }

    #[tokio::test]
    async fn test_connect_message_and_reply() {
        let mut server = ConnectionServer::new();
        let mut rx = server.start(0).await.unwrap();
        let (mut reader, mut writer) = framed_client(loopback(&server)).await;

        let record = match next_event(&mut rx).await {
            ServerEvent::PlayerConnected(record) => record,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(!record.is_host);
        assert!(record.stable_id > HOST_PLAYER_ID);
        assert!(record.display_name.starts_with("Player_"));

        writer.send(Bytes::from_static(b"hello")).await.unwrap();
        match next_event(&mut rx).await {
            ServerEvent::MessageReceived(id, frame) => {
                assert_eq!(id, record.stable_id);
                assert_eq!(&frame[..], b"hello");
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(server.send_to_player(record.stable_id, Bytes::from_static(b"direct")));
        server.send_to_all(Bytes::from_static(b"everyone"));
        assert_eq!(&timeout(WAIT, reader.next()).await.unwrap().unwrap().unwrap()[..], b"direct");
        assert_eq!(&timeout(WAIT, reader.next()).await.unwrap().unwrap().unwrap()[..], b"everyone");
        assert!(!server.send_to_player(999, Bytes::from_static(b"nobody")));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_remote_disconnect_raised_once() {
        let mut server = ConnectionServer::new();
        let mut rx = server.start(0).await.unwrap();
        let (reader, writer) = framed_client(loopback(&server)).await;

        let record = match next_event(&mut rx).await {
            ServerEvent::PlayerConnected(record) => record,
            other => panic!("unexpected event {:?}", other),
        };
        drop(reader);
        drop(writer);

        match next_event(&mut rx).await {
            ServerEvent::PlayerDisconnected(gone) => assert_eq!(gone, record),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(server.connection_count(), 0);
        assert!(!server.disconnect(record.stable_id));

        server.stop().await;
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.map_or(true, |e| e.is_none()));
    }

    #[tokio::test]
    async fn test_local_disconnect_flushes_and_closes() {
        let mut server = ConnectionServer::new();
        let mut rx = server.start(0).await.unwrap();
        let (mut reader, _writer) = framed_client(loopback(&server)).await;

        let id = match next_event(&mut rx).await {
            ServerEvent::PlayerConnected(record) => record.stable_id,
            other => panic!("unexpected event {:?}", other),
        };

        server.send_to_player(id, Bytes::from_static(b"bye"));
        assert!(server.disconnect(id));
        assert!(matches!(next_event(&mut rx).await, ServerEvent::PlayerDisconnected(r) if r.stable_id == id));

        assert_eq!(&timeout(WAIT, reader.next()).await.unwrap().unwrap().unwrap()[..], b"bye");
        assert!(timeout(WAIT, reader.next()).await.unwrap().is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_refuses_when_not_accepting() {
        let mut server = ConnectionServer::new();
        let mut rx = server.start(0).await.unwrap();
        server.set_accepting_new_connections(false);

        let mut stream = TcpStream::connect(loopback(&server)).await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(WAIT, stream.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        assert_eq!(server.connection_count(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_twice_and_port_reuse() {
        let mut server = ConnectionServer::new();
        let _rx = server.start(0).await.unwrap();
        let port = server.local_addr().unwrap().port();
        assert!(matches!(server.start(port).await, Err(ConnectionError::AlreadyRunning(_))));

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());

        let mut again = ConnectionServer::new();
        let _rx = again.start(port).await.unwrap();
        assert_eq!(again.local_addr().unwrap().port(), port);
        again.stop().await;
    }

    #[tokio::test]
    async fn test_stop_reports_open_connections() {
        let mut server = ConnectionServer::new();
        let mut rx = server.start(0).await.unwrap();
        let (mut reader, _writer) = framed_client(loopback(&server)).await;
        assert!(matches!(next_event(&mut rx).await, ServerEvent::PlayerConnected(_)));

        server.stop().await;
        assert!(matches!(next_event(&mut rx).await, ServerEvent::PlayerDisconnected(_)));
        assert!(timeout(WAIT, reader.next()).await.unwrap().is_none());
    }
}
