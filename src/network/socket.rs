use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tracing::{debug, info, warn};

/// Backlog for the session listener
const LISTEN_BACKLOG: u32 = 128;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("Failed to bind to {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn any_v4(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

/// Bind a TCP listener on all IPv4 interfaces with address reuse enabled,
/// so a port released by a stopped server can be bound again right away.
pub fn bind_session_listener(port: u16) -> Result<TcpListener, SocketError> {
    let addr = any_v4(port);
    debug!("Binding TCP listener to {}", addr);

    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .map_err(|source| SocketError::BindError { addr, source })?;
    let listener = socket.listen(LISTEN_BACKLOG)?;

    info!("TCP listener bound to {}", listener.local_addr()?);
    Ok(listener)
}

/// Bind the discovery receive socket. Address reuse lets several local
/// listeners share the same discovery port.
pub fn bind_discovery_socket(port: u16) -> Result<UdpSocket, SocketError> {
    let addr = any_v4(port);
    debug!("Binding UDP discovery socket to {}", addr);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|source| SocketError::BindError { addr, source })?;

    let socket = UdpSocket::from_std(socket.into())?;
    info!("UDP discovery socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Bind an ephemeral UDP socket allowed to send to broadcast addresses
pub fn bind_broadcast_sender() -> Result<UdpSocket, SocketError> {
    let addr = any_v4(0);
    let socket = std::net::UdpSocket::bind(addr).map_err(|source| SocketError::BindError { addr, source })?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

/// The IPv4 facts about one network interface needed to derive its broadcast address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceV4 {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Option<Ipv4Addr>,
    pub loopback: bool,
}

impl InterfaceV4 {
    /// Broadcast address of the interface's subnet
    pub fn broadcast_address(&self) -> Ipv4Addr {
        self.broadcast
            .unwrap_or_else(|| Ipv4Addr::from(u32::from(self.ip) | !u32::from(self.netmask)))
    }
}

/// One broadcast destination per non-loopback interface, without duplicates
pub fn broadcast_targets(interfaces: &[InterfaceV4]) -> Vec<Ipv4Addr> {
    let mut targets = Vec::new();
    for iface in interfaces.iter().filter(|iface| !iface.loopback) {
        let addr = iface.broadcast_address();
        if !targets.contains(&addr) {
            targets.push(addr);
        }
    }
    targets
}

/// Enumerate the machine's IPv4 interfaces
pub fn local_interfaces() -> Vec<InterfaceV4> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .filter_map(|iface| {
            let loopback = iface.is_loopback();
            match iface.addr {
                if_addrs::IfAddr::V4(v4) => Some(InterfaceV4 {
                    name: iface.name,
                    ip: v4.ip,
                    netmask: v4.netmask,
                    broadcast: v4.broadcast,
                    loopback,
                }),
                if_addrs::IfAddr::V6(_) => None,
            }
        })
        .collect()
}

/// Broadcast destinations for the current interface set. Falls back to the
/// limited broadcast address when no interface yields one.
pub fn local_broadcast_addresses() -> Vec<IpAddr> {
    let targets = broadcast_targets(&local_interfaces());
    if targets.is_empty() {
        debug!("No broadcast-capable interface found, using limited broadcast");
        return vec![IpAddr::V4(Ipv4Addr::BROADCAST)];
    }
    targets.into_iter().map(IpAddr::V4).collect()
}
