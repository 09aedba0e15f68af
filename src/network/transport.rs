use async_trait::async_trait;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration};

use crate::core::Config;
use crate::utils::{Result, ShareError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every peer on the segment.
    Broadcast,
    Unicast(SocketAddr),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Broadcast => f.write_str("broadcast"),
            Destination::Unicast(addr) => write!(f, "{}", addr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { from: SocketAddr, bytes: Vec<u8> },
    /// The link is gone; no further events follow.
    Closed,
}

/// Unreliable datagram link. Delivery may lose, duplicate or reorder.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, destination: Destination, bytes: &[u8]) -> Result<()>;

    /// Next inbound event. Only one task may wait on this at a time.
    async fn recv(&self) -> TransportEvent;

    fn local_addr(&self) -> SocketAddr;
}

/// Bind a UDP socket with `SO_REUSEADDR` (and `SO_REUSEPORT` where the
/// platform has it) so several nodes can share one host port.
pub fn create_reusable_udp_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ShareError::NetworkError(format!("Failed to create socket: {}", e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| ShareError::NetworkError(format!("Failed to set reuse_address: {}", e)))?;

    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    {
        if let Err(e) = socket.set_reuse_port(true) {
            warn!("Could not set SO_REUSEPORT (not critical): {}", e);
        }
    }

    socket
        .set_broadcast(true)
        .map_err(|e| ShareError::NetworkError(format!("Failed to set broadcast: {}", e)))?;

    socket
        .bind(&addr.into())
        .map_err(|e| ShareError::NetworkError(format!("Failed to bind to {}: {}", addr, e)))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| ShareError::NetworkError(format!("Failed to set nonblocking: {}", e)))?;

    UdpSocket::from_std(socket.into()).map_err(|e| {
        ShareError::NetworkError(format!("Failed to convert to tokio socket: {}", e))
    })
}

/// LAN transport: one UDP socket for unicast, broadcast and receive.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    max_datagram: usize,
}

impl UdpTransport {
    pub fn bind(config: &Config) -> Result<Self> {
        let bind_ip: IpAddr = config
            .bind_addr
            .parse()
            .map_err(|e| ShareError::ConfigError(format!("Invalid bind_addr: {}", e)))?;
        let broadcast_ip: IpAddr = config
            .broadcast_addr
            .parse()
            .map_err(|e| ShareError::ConfigError(format!("Invalid broadcast_addr: {}", e)))?;

        let socket = create_reusable_udp_socket(SocketAddr::new(bind_ip, config.port))?;
        let local_addr = socket.local_addr()?;
        info!("UDP transport listening on {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            broadcast_addr: SocketAddr::new(broadcast_ip, config.port),
            max_datagram: config.max_datagram,
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, destination: Destination, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.max_datagram {
            return Err(ShareError::NetworkError(format!(
                "Datagram of {} bytes exceeds limit of {}",
                bytes.len(),
                self.max_datagram
            )));
        }

        let target = match destination {
            Destination::Broadcast => self.broadcast_addr,
            Destination::Unicast(addr) => addr,
        };
        self.socket
            .send_to(bytes, target)
            .await
            .map_err(|e| ShareError::NetworkError(format!("send to {} failed: {}", target, e)))?;
        Ok(())
    }

    async fn recv(&self) -> TransportEvent {
        let mut buffer = vec![0u8; self.max_datagram];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, from)) => {
                    debug!("Received {} bytes from {}", len, from);
                    return TransportEvent::Message {
                        from,
                        bytes: buffer[..len].to_vec(),
                    };
                }
                Err(e) => {
                    warn!("UDP receive error: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
