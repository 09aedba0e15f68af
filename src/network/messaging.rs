use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::identity::PeerIdentity;
use crate::core::protocol::Body;
use crate::network::transport::{Destination, Transport};
use crate::utils::{BandwidthWindow, MetricsCollector, Result, ShareError};

/// Single outbound path of a node. Every message is wrapped (and signed, for
/// a source), shaped by the bandwidth window, then handed to the transport.
#[derive(Clone)]
pub struct Messenger {
    identity: Arc<PeerIdentity>,
    transport: Arc<dyn Transport>,
    limiter: BandwidthWindow,
    metrics: MetricsCollector,
    cancel: CancellationToken,
}

impl Messenger {
    pub fn new(
        identity: Arc<PeerIdentity>,
        transport: Arc<dyn Transport>,
        limiter: BandwidthWindow,
        metrics: MetricsCollector,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity,
            transport,
            limiter,
            metrics,
            cancel,
        }
    }

    pub async fn send_to(&self, address: SocketAddr, body: Body) -> Result<()> {
        self.send(Destination::Unicast(address), body).await
    }

    pub async fn broadcast(&self, body: Body) -> Result<()> {
        self.send(Destination::Broadcast, body).await
    }

    async fn send(&self, destination: Destination, body: Body) -> Result<()> {
        let kind = body.kind();
        let bytes = self.identity.sign(body)?.encode()?;

        self.limiter.acquire(bytes.len() as u64).await;

        // Checked after the wait: a send parked in the window must not go
        // out once the node has disconnected.
        if self.cancel.is_cancelled() {
            return Err(ShareError::NetworkError(format!(
                "node {} is disconnected, {} not sent",
                self.identity.id.short(),
                kind
            )));
        }

        self.transport.send(destination, &bytes).await?;
        self.metrics.record_sent(bytes.len() as u64).await;
        debug!("Sent {} ({} bytes) to {}", kind, bytes.len(), destination);
        Ok(())
    }
}
