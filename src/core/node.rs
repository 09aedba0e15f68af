use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;

use crate::core::events::{EventSink, NodeEvent};
use crate::core::identity::{PeerIdentity, TrustState};
use crate::core::peer::{PeerDirectory, PeerRecord};
use crate::core::protocol::{now_millis, Advertisement, Body, Envelope, FileId, PeerId, Role};
use crate::core::Config;
use crate::network::{Discovery, Messenger, Transport, TransportEvent};
use crate::storage::{ChunkStore, FileDescriptor, FileSink};
use crate::transfer::{DownloadProgress, Downloader, SessionState, SessionTable, Uploader};
use crate::utils::{BandwidthWindow, MetricsCollector, Result, ShareError, TransferMetrics};

/// Handles to the services one node shares between its tasks.
#[derive(Clone)]
pub struct NodeContext {
    pub config: Arc<Config>,
    pub identity: Arc<PeerIdentity>,
    pub directory: Arc<RwLock<PeerDirectory>>,
    pub store: Arc<RwLock<ChunkStore>>,
    pub sessions: Arc<RwLock<SessionTable>>,
    pub trust: Arc<RwLock<TrustState>>,
    pub messenger: Messenger,
    pub events: EventSink,
    pub metrics: MetricsCollector,
    /// Root token; every timer of the node hangs off it.
    pub cancel: CancellationToken,
}

impl NodeContext {
    pub fn new(
        config: Config,
        role: Role,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, UnboundedReceiver<NodeEvent>)> {
        config.validate()?;

        let identity = Arc::new(PeerIdentity::create(
            role,
            config.node_name.clone(),
            transport.local_addr(),
        ));
        let trust = match role {
            Role::Source => TrustState::for_source(&identity, &config.session_secret)?,
            Role::Consumer => TrustState::default(),
        };

        let (events, rx) = EventSink::channel();
        let metrics = MetricsCollector::new();
        let cancel = CancellationToken::new();
        let limiter = BandwidthWindow::new(
            config.bandwidth_limit,
            config.bandwidth_window(),
            config.bandwidth_poll(),
        );
        let messenger = Messenger::new(
            identity.clone(),
            transport,
            limiter,
            metrics.clone(),
            cancel.clone(),
        );
        let directory = PeerDirectory::new(identity.id, config.staleness(), events.clone());

        let ctx = Self {
            config: Arc::new(config),
            identity,
            directory: Arc::new(RwLock::new(directory)),
            store: Arc::new(RwLock::new(ChunkStore::new())),
            sessions: Arc::new(RwLock::new(SessionTable::new())),
            trust: Arc::new(RwLock::new(trust)),
            messenger,
            events,
            metrics,
            cancel,
        };
        Ok((ctx, rx))
    }
}

/// A peer on the segment, either the source of a session or a consumer.
#[derive(Clone)]
pub struct Node {
    ctx: NodeContext,
    transport: Arc<dyn Transport>,
    discovery: Discovery,
    downloader: Downloader,
    uploader: Uploader,
}

impl Node {
    pub fn new(
        config: Config,
        role: Role,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn FileSink>,
    ) -> Result<(Self, UnboundedReceiver<NodeEvent>)> {
        let (ctx, events) = NodeContext::new(config, role, transport.clone())?;

        let node = Self {
            discovery: Discovery::new(ctx.clone()),
            downloader: Downloader::new(ctx.clone(), sink),
            uploader: Uploader::new(ctx.clone()),
            transport,
            ctx,
        };
        Ok((node, events))
    }

    /// Spawn the inbound, presence and sweep loops. A consumer also probes
    /// for sources right away.
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting {} node {} ({}) on {}",
            self.role(),
            self.id().short(),
            self.ctx.identity.name,
            self.transport.local_addr()
        );

        self.start_inbound();
        self.start_discovery_service();
        self.start_peer_management();

        if self.role() == Role::Consumer {
            self.discovery.probe().await?;
        }
        Ok(())
    }

    fn start_inbound(&self) {
        let node = self.clone();
        let cancel = self.ctx.cancel.child_token();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = node.transport.recv() => event,
                };

                match event {
                    TransportEvent::Message { from, bytes } => {
                        node.ctx.metrics.record_received(bytes.len() as u64).await;
                        if let Err(e) = node.handle_datagram(from, &bytes).await {
                            warn!("Failed to handle message from {}: {}", from, e);
                        }
                    }
                    TransportEvent::Closed => {
                        info!("Transport closed, disconnecting");
                        node.shutdown().await;
                        break;
                    }
                }
            }
            debug!("Inbound loop stopped");
        });
    }

    fn start_discovery_service(&self) {
        let discovery = self.discovery.clone();
        let cancel = self.ctx.cancel.child_token();
        let period = self.ctx.config.broadcast_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = discovery.announce().await {
                            warn!("Discovery announcement failed: {}", e);
                        }
                    }
                }
            }
            debug!("Discovery loop stopped");
        });
    }

    fn start_peer_management(&self) {
        let discovery = self.discovery.clone();
        let cancel = self.ctx.cancel.child_token();
        let period = self.ctx.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => discovery.sweep().await,
                }
            }
            debug!("Peer sweep loop stopped");
        });
    }

    async fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) -> Result<()> {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", from, e);
                self.ctx.metrics.record_dropped().await;
                return Ok(());
            }
        };

        match self.discovery.admit(&envelope, from).await {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(e) => {
                warn!("Dropping {} from {}: {}", envelope.body.kind(), from, e);
                self.ctx.metrics.record_dropped().await;
                return Ok(());
            }
        }

        let sender = envelope.peer_id;
        match envelope.body {
            Body::Discovery { name } => {
                debug!("Presence from {} ({}) at {}", name, sender.short(), from);
            }
            Body::Probe => {
                let discovery = self.discovery.clone();
                tokio::spawn(async move {
                    if let Err(e) = discovery.answer_probe(from).await {
                        warn!("Failed to answer probe from {}: {}", from, e);
                    }
                });
            }
            Body::Advertise(ad) => {
                if self.role() == Role::Consumer && envelope.role == Role::Source {
                    self.ctx
                        .directory
                        .write()
                        .await
                        .record_holds_all(sender, &ad.file_id);
                    self.downloader.on_advertise(ad).await?;
                }
            }
            Body::ChunkAvailable { file_id, chunks } => {
                self.ctx
                    .directory
                    .write()
                    .await
                    .record_holds(sender, &file_id, &chunks);
            }
            Body::ChunkRequest {
                file_id,
                chunk_index,
            } => {
                let uploader = self.uploader.clone();
                tokio::spawn(async move {
                    if let Err(e) = uploader
                        .handle_chunk_request(sender, from, file_id, chunk_index)
                        .await
                    {
                        warn!("Failed to serve chunk to {}: {}", from, e);
                    }
                });
            }
            Body::ChunkResponse(payload) => {
                if self.role() == Role::Consumer {
                    self.downloader.accept_chunk(sender, payload).await?;
                }
            }
        }
        Ok(())
    }

    /// Read, split, encrypt and advertise a local file.
    pub async fn share_file(&self, path: &Path) -> Result<FileDescriptor> {
        let content = tokio::fs::read(path).await.map_err(|e| {
            ShareError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ShareError::FileNotFound(path.display().to_string()))?;
        self.share_bytes(&name, &content).await
    }

    pub async fn share_bytes(&self, name: &str, content: &[u8]) -> Result<FileDescriptor> {
        if self.role() != Role::Source {
            return Err(ShareError::ConfigError(
                "only a source node shares files".into(),
            ));
        }

        let cipher = self
            .ctx
            .trust
            .read()
            .await
            .cipher()
            .cloned()
            .ok_or_else(|| ShareError::CryptoError("source has no session key".into()))?;
        let descriptor = self.ctx.store.write().await.share(
            name,
            content,
            self.ctx.config.chunk_size,
            &cipher,
            now_millis(),
        )?;

        self.ctx
            .sessions
            .write()
            .await
            .announce(&descriptor.file_id, Role::Source, Instant::now());
        self.ctx.metrics.record_file_shared().await;

        // Late joiners still get it from the next presence tick or a probe.
        if let Err(e) = self
            .ctx
            .messenger
            .broadcast(Body::Advertise(descriptor.advertisement()))
            .await
        {
            warn!("Advertisement of {} failed: {}", descriptor.file_id, e);
        }

        info!(
            "Sharing {} as {} ({} chunks)",
            name, descriptor.file_id, descriptor.total_chunks
        );
        Ok(descriptor)
    }

    /// Fetch an advertised file. Only needed when `auto_download` is off.
    pub async fn download(&self, file_id: &FileId) -> Result<()> {
        if self.role() != Role::Consumer {
            return Err(ShareError::ConfigError(
                "a source node does not download".into(),
            ));
        }
        self.downloader.start(file_id).await
    }

    pub async fn cancel_download(&self, file_id: &FileId) -> bool {
        self.downloader.cancel(file_id).await
    }

    pub async fn get_download_progress(&self, file_id: &FileId) -> Option<DownloadProgress> {
        self.downloader.get_download_progress(file_id).await
    }

    pub async fn active_downloads(&self) -> Vec<DownloadProgress> {
        self.downloader.active_downloads().await
    }

    /// Files this node shares or has seen advertised.
    pub async fn files(&self) -> Vec<Advertisement> {
        self.ctx
            .store
            .read()
            .await
            .descriptors()
            .into_iter()
            .map(FileDescriptor::advertisement)
            .collect()
    }

    pub async fn session_state(&self, file_id: &FileId) -> Option<SessionState> {
        self.ctx.sessions.read().await.state(file_id)
    }

    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.ctx.directory.read().await.peers()
    }

    pub async fn metrics(&self) -> TransferMetrics {
        self.ctx.metrics.snapshot().await
    }

    pub async fn log_summary(&self) {
        self.ctx.metrics.log_summary().await;
    }

    pub fn id(&self) -> PeerId {
        self.ctx.identity.id
    }

    pub fn role(&self) -> Role {
        self.ctx.identity.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn is_running(&self) -> bool {
        !self.ctx.cancel.is_cancelled()
    }

    /// Stop every timer of this node. Nothing is sent afterwards.
    pub async fn shutdown(&self) {
        if self.ctx.cancel.is_cancelled() {
            return;
        }
        self.ctx.cancel.cancel();
        self.downloader.stop_all().await;
        info!("Node {} disconnected", self.id().short());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;
    use crate::storage::MemorySink;

    async fn node(network: &MemoryNetwork, role: Role) -> Node {
        let (node, _events) = Node::new(
            Config::default(),
            role,
            Arc::new(network.endpoint().await),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        node
    }

    #[tokio::test]
    async fn test_only_sources_share_and_only_consumers_download() {
        let network = MemoryNetwork::new();
        let source = node(&network, Role::Source).await;
        let consumer = node(&network, Role::Consumer).await;

        assert!(consumer.share_bytes("a", b"abc").await.is_err());
        assert!(source.download(&FileId::new("x")).await.is_err());
        assert!(matches!(
            consumer.download(&FileId::new("x")).await,
            Err(ShareError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_share_registers_session_and_metrics() {
        let network = MemoryNetwork::new();
        let source = node(&network, Role::Source).await;
        let descriptor = source.share_bytes("a.txt", &[1u8; 40_000]).await.unwrap();

        assert_eq!(descriptor.total_chunks, 3);
        assert_eq!(
            source.session_state(&descriptor.file_id).await,
            Some(SessionState::Announced)
        );
        assert_eq!(source.files().await.len(), 1);
        assert_eq!(source.metrics().await.files_shared, 1);
    }

    #[tokio::test]
    async fn test_share_file_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slides.pdf");
        std::fs::write(&path, b"%PDF").unwrap();

        let network = MemoryNetwork::new();
        let source = node(&network, Role::Source).await;
        let descriptor = source.share_file(&path).await.unwrap();
        assert_eq!(descriptor.name, "slides.pdf");
        assert_eq!(descriptor.size, 4);

        assert!(source.share_file(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let network = MemoryNetwork::new();
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        let result = Node::new(
            config,
            Role::Source,
            Arc::new(network.endpoint().await),
            Arc::new(MemorySink::new()),
        );
        assert!(matches!(result, Err(ShareError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let network = MemoryNetwork::new();
        let consumer = node(&network, Role::Consumer).await;
        consumer.start().await.unwrap();
        assert!(consumer.is_running());
        consumer.shutdown().await;
        consumer.shutdown().await;
        assert!(!consumer.is_running());
    }
}
