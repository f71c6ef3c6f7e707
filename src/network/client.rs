use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connection::PeerLink;

/// Events raised by the connection client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected(SocketAddr),
    /// Raised once per established connection, whichever side closed it
    Disconnected,
    MessageReceived(Bytes),
    ConnectionError(String),
}

/// Holds at most one outbound session connection
#[derive(Debug)]
pub struct ConnectionClient {
    link: Option<PeerLink>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ConnectionClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { link: None, events: tx }, rx)
    }

    /// Connect to a session. Does nothing while a connection is open.
    pub async fn connect(&mut self, addr: SocketAddr) {
        if self.is_connected() {
            debug!("Already connected, ignoring connect to {}", addr);
            return;
        }

        debug!("Connecting to {}", addr);
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to {}: {}", addr, e);
                let _ = self.events.send(ClientEvent::ConnectionError(e.to_string()));
                return;
            }
        };

        let frame_events = self.events.clone();
        let close_events = self.events.clone();
        self.link = Some(PeerLink::spawn(
            stream,
            addr,
            move |frame| {
                let _ = frame_events.send(ClientEvent::MessageReceived(frame));
            },
            move || {
                info!("Disconnected from {}", addr);
                let _ = close_events.send(ClientEvent::Disconnected);
            },
        ));

        info!("Connected to {}", addr);
        let _ = self.events.send(ClientEvent::Connected(addr));
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(PeerLink::is_alive)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().filter(|link| link.is_alive()).map(PeerLink::addr)
    }

    /// Send one frame. Dropped, not queued, when not connected.
    pub fn send_message(&self, payload: Bytes) -> bool {
        match &self.link {
            Some(link) if link.is_alive() => link.send(payload),
            _ => {
                debug!("Not connected, dropping {} byte message", payload.len());
                false
            }
        }
    }

    pub fn disconnect_from_server(&mut self) {
        if let Some(link) = self.link.take() {
            let addr = link.addr();
            if link.close() {
                info!("Disconnected from {}", addr);
                let _ = self.events.send(ClientEvent::Disconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::{ConnectionServer, ServerEvent};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(WAIT, rx.recv()).await.expect("timed out").expect("channel closed")
    }

    #[tokio::test]
    async fn test_send_and_disconnect_when_idle_are_noops() {
        let (mut client, mut rx) = ConnectionClient::new();
        assert!(!client.is_connected());
        assert!(!client.send_message(Bytes::from_static(b"lost")));
        client.disconnect_from_server();
        client.disconnect_from_server();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connection_refused_is_reported() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (mut client, mut rx) = ConnectionClient::new();
        client.connect(SocketAddr::from(([127, 0, 0, 1], port))).await;
        assert!(matches!(next(&mut rx).await, ClientEvent::ConnectionError(_)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_round_trip_with_server() {
        let mut server = ConnectionServer::new();
        let mut server_rx = server.start(0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().unwrap().port()));

        let (mut client, mut rx) = ConnectionClient::new();
        client.connect(addr).await;
        assert_eq!(next(&mut rx).await, ClientEvent::Connected(addr));
        assert_eq!(client.peer_addr(), Some(addr));

        // A second connect while connected is ignored
        client.connect(addr).await;

        let id = match next(&mut server_rx).await {
            ServerEvent::PlayerConnected(record) => record.stable_id,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(timeout(Duration::from_millis(200), server_rx.recv()).await.is_err());

        assert!(client.send_message(Bytes::from_static(b"ping")));
        assert!(matches!(next(&mut server_rx).await, ServerEvent::MessageReceived(from, frame) if from == id && &frame[..] == b"ping"));

        server.send_to_player(id, Bytes::from_static(b"pong"));
        assert_eq!(next(&mut rx).await, ClientEvent::MessageReceived(Bytes::from_static(b"pong")));

        client.disconnect_from_server();
        assert_eq!(next(&mut rx).await, ClientEvent::Disconnected);
        client.disconnect_from_server();
        assert!(matches!(next(&mut server_rx).await, ServerEvent::PlayerDisconnected(r) if r.stable_id == id));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_server_side_disconnect_reported_once() {
        let mut server = ConnectionServer::new();
        let mut server_rx = server.start(0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], server.local_addr().unwrap().port()));

        let (mut client, mut rx) = ConnectionClient::new();
        client.connect(addr).await;
        assert!(matches!(next(&mut rx).await, ClientEvent::Connected(_)));
        let id = match next(&mut server_rx).await {
            ServerEvent::PlayerConnected(record) => record.stable_id,
            other => panic!("unexpected event {:?}", other),
        };

        server.disconnect(id);
        assert_eq!(next(&mut rx).await, ClientEvent::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.send_message(Bytes::from_static(b"late")));

        client.disconnect_from_server();
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

        server.stop().await;
    }
}
