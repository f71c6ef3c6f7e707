use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::protocol::{LobbyDescriptor, MAX_PAYLOAD_SIZE, ProtocolError, WireRecord};
use super::socket::{self, SocketError};

/// Time between lobby announcements
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Socket error: {0}")]
    SocketError(#[from] SocketError),

    #[error("Protocol error: {0}")]
    ProtocolError(#[from] ProtocolError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Discovery listener already running on {0}")]
    AlreadyRunning(SocketAddr),
}

/// A lobby heard on the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLobby {
    /// The announced descriptor, `origin_address` set from `sender`
    pub descriptor: LobbyDescriptor,
    /// Transport address the announcement came from
    pub sender: SocketAddr,
}

impl DiscoveredLobby {
    /// Where to open the session connection
    pub fn session_addr(&self) -> SocketAddr {
        SocketAddr::new(self.sender.ip(), self.descriptor.tcp_port)
    }
}

/// Produces the destination addresses for announcements
pub type TargetProvider = Arc<dyn Fn() -> Vec<IpAddr> + Send + Sync>;

/// Periodically announces the lobby descriptor to every broadcast address
pub struct AnnouncementBroadcaster {
    port: u16,
    targets: TargetProvider,
    descriptor: watch::Sender<LobbyDescriptor>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for AnnouncementBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnouncementBroadcaster")
            .field("port", &self.port)
            .field("targets", &"<TargetProvider>")
            .field("descriptor", &*self.descriptor.borrow())
            .field("running", &self.is_running())
            .finish()
    }
}

impl AnnouncementBroadcaster {
    /// Announce to the broadcast address of every local interface on `port`
    pub fn new(port: u16) -> Self {
        Self::with_target_provider(port, Arc::new(socket::local_broadcast_addresses))
    }

    pub fn with_target_provider(port: u16, targets: TargetProvider) -> Self {
        let (descriptor, _) = watch::channel(LobbyDescriptor::default());
        Self {
            port,
            targets,
            descriptor,
            task: None,
        }
    }

    /// Start announcing `descriptor`. When already running only the payload changes.
    pub fn start(&mut self, descriptor: LobbyDescriptor) -> Result<(), DiscoveryError> {
        self.descriptor.send_replace(descriptor);
        if self.is_running() {
            return Ok(());
        }

        let socket = socket::bind_broadcast_sender()?;
        let payload = self.descriptor.subscribe();
        self.task = Some(tokio::spawn(broadcast_loop(
            socket,
            self.port,
            Arc::clone(&self.targets),
            payload,
        )));

        info!("Started lobby broadcast on port {}", self.port);
        Ok(())
    }

    /// Replace the payload of the next announcement without touching the timer
    pub fn update(&self, descriptor: LobbyDescriptor) {
        self.descriptor.send_replace(descriptor);
    }

    pub fn descriptor(&self) -> LobbyDescriptor {
        self.descriptor.borrow().clone()
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Stopped lobby broadcast on port {}", self.port);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for AnnouncementBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn broadcast_loop(
    socket: UdpSocket,
    port: u16,
    targets: TargetProvider,
    payload: watch::Receiver<LobbyDescriptor>,
) {
    let mut addresses = targets();
    debug!("Broadcast targets: {:?}", addresses);

    let mut interval = time::interval(BROADCAST_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let data = match payload.borrow().encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode lobby announcement: {}", e);
                continue;
            }
        };

        let mut stale = false;
        for ip in &addresses {
            let target = SocketAddr::new(*ip, port);
            match socket.send_to(&data, target).await {
                Ok(sent) => trace!("Sent {} byte announcement to {}", sent, target),
                Err(e) => {
                    warn!("Failed to send announcement to {}: {}", target, e);
                    stale = true;
                }
            }
        }

        if stale {
            addresses = targets();
            debug!("Recomputed broadcast targets: {:?}", addresses);
        }
    }
}

/// Receives lobby announcements on the discovery port
#[derive(Debug)]
pub struct AnnouncementListener {
    port: u16,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl AnnouncementListener {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            local_addr: None,
            task: None,
        }
    }

    /// Bind the discovery port and start reporting lobbies.
    /// Bind failures are returned and not retried.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<DiscoveredLobby>, DiscoveryError> {
        if let Some(addr) = self.local_addr {
            if self.is_running() {
                return Err(DiscoveryError::AlreadyRunning(addr));
            }
            // The loop ended on its own; release it before binding again
            self.stop();
        }

        let socket = socket::bind_discovery_socket(self.port)?;
        let local_addr = socket.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        self.task = Some(tokio::spawn(listen_loop(socket, tx)));
        self.local_addr = Some(local_addr);

        info!("Listening for lobbies on {}", local_addr);
        Ok(rx)
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(addr) = self.local_addr.take() {
            info!("Stopped listening for lobbies on {}", addr);
        }
    }

    /// False once stopped or once the receiver handed out by `start` is gone
    pub fn is_running(&self) -> bool {
        self.local_addr.is_some() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for AnnouncementListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn listen_loop(socket: UdpSocket, events: mpsc::UnboundedSender<DiscoveredLobby>) {
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE * 2];

    loop {
        let (len, sender) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("Failed to receive UDP data: {}", e);
                continue;
            }
        };

        let mut descriptor = match LobbyDescriptor::decode(&buf[..len]) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                trace!("Ignoring {} byte datagram from {}: {}", len, sender, e);
                continue;
            }
        };
        descriptor.origin_address = Some(sender.ip());

        debug!("Discovered lobby '{}' at {}", descriptor.name, sender);
        if events.send(DiscoveredLobby { descriptor, sender }).is_err() {
            debug!("Discovery receiver dropped, stopping listener");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn loopback_targets() -> TargetProvider {
        Arc::new(|| vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }

    fn started_listener() -> (AnnouncementListener, mpsc::UnboundedReceiver<DiscoveredLobby>, SocketAddr) {
        let mut listener = AnnouncementListener::new(0);
        let rx = listener.start().unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, rx, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[tokio::test]
    async fn test_listener_reports_sender_address() {
        let (mut listener, mut rx, addr) = started_listener();

        let mut descriptor = LobbyDescriptor::new("den", 3, 40000);
        descriptor.current_players = 1;
        descriptor.origin_address = Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&descriptor.encode().unwrap(), addr).await.unwrap();

        let found = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(found.sender, sender.local_addr().unwrap());
        assert_eq!(found.descriptor.name, "den");
        assert_eq!(found.descriptor.origin_address, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(found.session_addr(), SocketAddr::from(([127, 0, 0, 1], 40000)));

        listener.stop();
    }

    #[tokio::test]
    async fn test_truncated_datagram_is_ignored() {
        let (mut listener, mut rx, addr) = started_listener();
        let bytes = LobbyDescriptor::new("den", 3, 40000).encode().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender.send_to(&bytes[..5], addr).await.unwrap();
        sender.send_to(b"", addr).await.unwrap();
        assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());

        // Still alive afterwards
        sender.send_to(&bytes, addr).await.unwrap();
        let found = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(found.descriptor.tcp_port, 40000);

        listener.stop();
    }

    #[tokio::test]
    async fn test_listener_stop_is_idempotent() {
        let mut never_started = AnnouncementListener::new(0);
        never_started.stop();
        never_started.stop();

        let (mut listener, _rx, _) = started_listener();
        assert!(matches!(listener.start(), Err(DiscoveryError::AlreadyRunning(_))));
        listener.stop();
        listener.stop();
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_listener_stops_when_receiver_dropped() {
        let (mut listener, rx, addr) = started_listener();
        drop(rx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = LobbyDescriptor::new("nobody listening", 2, 1).encode().unwrap();
        sender.send_to(&bytes, addr).await.unwrap();

        timeout(WAIT, async {
            while listener.is_running() {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener kept running without a receiver");

        // A finished listener can be started again
        let _rx = listener.start().unwrap();
        assert!(listener.is_running());
        listener.stop();
    }

    #[tokio::test]
    async fn test_two_listeners_share_the_port() {
        let (mut first, _rx, addr) = started_listener();
        let mut second = AnnouncementListener::new(addr.port());
        assert!(second.start().is_ok());
        first.stop();
        second.stop();
    }

    #[tokio::test]
    async fn test_broadcaster_announces_and_updates() {
        let (mut listener, mut rx, addr) = started_listener();
        let mut broadcaster = AnnouncementBroadcaster::with_target_provider(addr.port(), loopback_targets());

        let mut descriptor = LobbyDescriptor::new("arena", 2, 45678);
        descriptor.current_players = 1;
        broadcaster.start(descriptor.clone()).unwrap();
        assert!(broadcaster.is_running());

        let found = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(found.descriptor.name, "arena");
        assert_eq!(found.descriptor.current_players, 1);

        descriptor.current_players = 2;
        broadcaster.update(descriptor);
        let updated = timeout(WAIT, async {
            loop {
                let found = rx.recv().await.unwrap();
                if found.descriptor.current_players == 2 {
                    return found;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(updated.descriptor.max_players, 2);

        broadcaster.stop();
        broadcaster.stop();
        assert!(!broadcaster.is_running());
        listener.stop();
    }

    #[tokio::test]
    async fn test_failed_send_recomputes_targets() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        // An IPv6 target can never be reached from the IPv4 sender
        let unreachable: TargetProvider = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]
        });

        let mut broadcaster = AnnouncementBroadcaster::with_target_provider(1, unreachable);
        broadcaster.start(LobbyDescriptor::new("lost", 2, 1)).unwrap();

        timeout(WAIT, async {
            while calls.load(Ordering::SeqCst) < 3 {
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("targets were not recomputed after failed sends");
        assert!(broadcaster.is_running());

        broadcaster.stop();
    }

    #[tokio::test]
    async fn test_stopped_broadcaster_goes_quiet() {
        let (mut listener, mut rx, addr) = started_listener();
        let mut broadcaster = AnnouncementBroadcaster::with_target_provider(addr.port(), loopback_targets());
        broadcaster.start(LobbyDescriptor::new("quiet", 2, 1)).unwrap();
        timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        broadcaster.stop();
        tokio::task::yield_now().await;
        while rx.try_recv().is_ok() {}
        assert!(timeout(BROADCAST_INTERVAL * 2, rx.recv()).await.is_err());

        listener.stop();
    }
}
