//! In-process datagram hub.
//!
//! Every endpoint gets its own loopback address. Broadcasts reach every
//! other endpoint. An optional interceptor sees each delivery and may drop
//! or rewrite it, which is how tests simulate loss and tampering.

use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::network::transport::{Destination, Transport, TransportEvent};
use crate::utils::{Result, ShareError};

const FIRST_PORT: u16 = 40_000;

/// Decides the fate of one delivery: `(from, to, bytes)`. Returning `false`
/// drops it; the bytes may be modified in place.
pub type Interceptor = Arc<dyn Fn(SocketAddr, SocketAddr, &mut Vec<u8>) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

#[derive(Default)]
struct Hub {
    endpoints: BTreeMap<SocketAddr, mpsc::UnboundedSender<TransportEvent>>,
    next_port: u16,
    interceptor: Option<Interceptor>,
    delivered: u64,
    dropped: u64,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn endpoint(&self) -> MemoryTransport {
        let mut hub = self.hub.lock().await;
        let port = FIRST_PORT + hub.next_port;
        hub.next_port += 1;

        let address = SocketAddr::from(([127, 0, 0, 1], port));
        let (tx, rx) = mpsc::unbounded_channel();
        hub.endpoints.insert(address, tx);
        debug!("Memory endpoint {} attached", address);

        MemoryTransport {
            address,
            network: self.clone(),
            inbox: Mutex::new(rx),
        }
    }

    pub async fn set_interceptor(&self, interceptor: Interceptor) {
        self.hub.lock().await.interceptor = Some(interceptor);
    }

    pub async fn clear_interceptor(&self) {
        self.hub.lock().await.interceptor = None;
    }

    /// Detach an endpoint and tell it the link is closed.
    pub async fn disconnect(&self, address: SocketAddr) {
        if let Some(tx) = self.hub.lock().await.endpoints.remove(&address) {
            let _ = tx.send(TransportEvent::Closed);
            debug!("Memory endpoint {} detached", address);
        }
    }

    /// Deliveries that reached an endpoint so far.
    pub async fn delivered(&self) -> u64 {
        self.hub.lock().await.delivered
    }

    pub async fn dropped(&self) -> u64 {
        self.hub.lock().await.dropped
    }

    async fn route(&self, from: SocketAddr, destination: Destination, bytes: &[u8]) -> Result<()> {
        let mut hub = self.hub.lock().await;
        if !hub.endpoints.contains_key(&from) {
            return Err(ShareError::NetworkError(format!("{} is not connected", from)));
        }

        let targets: Vec<SocketAddr> = match destination {
            Destination::Broadcast => hub
                .endpoints
                .keys()
                .copied()
                .filter(|a| *a != from)
                .collect(),
            Destination::Unicast(to) => vec![to],
        };

        for to in targets {
            let mut copy = bytes.to_vec();
            let keep = match &hub.interceptor {
                Some(interceptor) => interceptor(from, to, &mut copy),
                None => true,
            };
            let sent = keep
                && hub
                    .endpoints
                    .get(&to)
                    .map(|tx| tx.send(TransportEvent::Message { from, bytes: copy }).is_ok())
                    .unwrap_or(false);
            if sent {
                hub.delivered += 1;
            } else {
                hub.dropped += 1;
            }
        }
        Ok(())
    }
}

pub struct MemoryTransport {
    address: SocketAddr,
    network: MemoryNetwork,
    inbox: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl MemoryTransport {
    pub async fn close(&self) {
        self.network.disconnect(self.address).await;
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, destination: Destination, bytes: &[u8]) -> Result<()> {
        self.network.route(self.address, destination, bytes).await
    }

    async fn recv(&self) -> TransportEvent {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed)
    }

    fn local_addr(&self) -> SocketAddr {
        self.address
    }
}
