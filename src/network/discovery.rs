use log::{debug, info, warn};
use std::net::SocketAddr;
use tokio::time::Instant;

use crate::core::events::NodeEvent;
use crate::core::identity::{authenticate, TrustAnchor};
use crate::core::node::NodeContext;
use crate::core::protocol::{Body, Envelope, Role};
use crate::utils::{Result, ShareError};

/// Presence broadcasts, probe answers and the inbound trust gate.
#[derive(Clone)]
pub struct Discovery {
    ctx: NodeContext,
}

impl Discovery {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    /// One presence tick: a `Discovery` message, then the advertisements of
    /// a source or the held chunks of a redistributing consumer.
    pub async fn announce(&self) -> Result<()> {
        self.ctx.messenger.broadcast(self.presence()).await?;

        for body in self.holdings().await {
            self.ctx.messenger.broadcast(body).await?;
        }

        debug!("Announced presence on network");
        Ok(())
    }

    /// Ask sources to announce themselves now instead of at their next tick.
    pub async fn probe(&self) -> Result<()> {
        self.ctx.messenger.broadcast(Body::Probe).await
    }

    /// Unicast presence plus holdings back to whoever probed. A consumer
    /// with nothing to offer stays quiet.
    pub async fn answer_probe(&self, to: SocketAddr) -> Result<()> {
        let holdings = self.holdings().await;
        if self.ctx.identity.role != Role::Source && holdings.is_empty() {
            return Ok(());
        }

        debug!("Answering probe from {}", to);
        self.ctx.messenger.send_to(to, self.presence()).await?;
        for body in holdings {
            self.ctx.messenger.send_to(to, body).await?;
        }
        Ok(())
    }

    /// Decide whether an inbound envelope may reach the rest of the node.
    ///
    /// `Ok(true)` means dispatch it, `Ok(false)` means ignore it quietly
    /// (our own echo, or source traffic before the session start arrived).
    /// An `Err` is an authentication failure and the envelope is dropped.
    /// Admitted senders are refreshed in the peer directory.
    pub async fn admit(&self, envelope: &Envelope, from: SocketAddr) -> Result<bool> {
        if envelope.peer_id == self.ctx.identity.id {
            return Ok(false);
        }

        if let Err(e) = authenticate(envelope) {
            self.ctx.metrics.record_auth_failure().await;
            return Err(e);
        }

        if envelope.role == Role::Source && self.ctx.identity.role == Role::Consumer {
            match self.check_anchor(envelope).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Ignoring {} from {} until its session start arrives",
                        envelope.body.kind(),
                        envelope.peer_id.short()
                    );
                    return Ok(false);
                }
                Err(e) => {
                    self.ctx.metrics.record_auth_failure().await;
                    return Err(e);
                }
            }
        }

        self.ctx
            .directory
            .write()
            .await
            .observe(envelope.peer_id, from, envelope.role, Instant::now());
        Ok(true)
    }

    async fn check_anchor(&self, envelope: &Envelope) -> Result<bool> {
        let mut trust = self.ctx.trust.write().await;

        if let Some(anchor) = trust.anchor() {
            if anchor.matches(envelope) {
                return Ok(true);
            }
            return Err(ShareError::AuthenticationFailure(format!(
                "source {} is not the session source {}",
                envelope.peer_id.short(),
                anchor.peer_id.short()
            )));
        }

        let Body::Discovery { name } = &envelope.body else {
            return Ok(false);
        };
        let anchor = TrustAnchor::from_envelope(envelope).ok_or_else(|| {
            ShareError::AuthenticationFailure(format!(
                "session start from {} carries no session id",
                envelope.peer_id.short()
            ))
        })?;

        let (peer_id, session_id) = (anchor.peer_id, anchor.session_id);
        trust.pin(anchor, &self.ctx.config.session_secret)?;
        drop(trust);

        info!(
            "Trusting source {} ({}) for session {}",
            name,
            peer_id.short(),
            session_id
        );
        self.ctx.events.emit(NodeEvent::SourceFound {
            peer_id,
            name: name.clone(),
            session_id,
        });
        Ok(true)
    }

    /// Evict silent peers; runs on the sweep tick.
    pub async fn sweep(&self) {
        let lost = self.ctx.directory.write().await.sweep(Instant::now());
        if !lost.is_empty() {
            warn!("{} peer(s) went silent", lost.len());
        }
    }

    fn presence(&self) -> Body {
        Body::Discovery {
            name: self.ctx.identity.name.clone(),
        }
    }

    /// What this node can serve: complete files for a source, held chunk
    /// indices for a consumer that redistributes.
    async fn holdings(&self) -> Vec<Body> {
        let store = self.ctx.store.read().await;
        let descriptors = store.descriptors().into_iter();
        match self.ctx.identity.role {
            Role::Source => descriptors
                .filter(|d| d.is_complete())
                .map(|d| Body::Advertise(d.advertisement()))
                .collect(),
            Role::Consumer if self.ctx.config.redistribute => descriptors
                .filter(|d| !d.available.is_empty())
                .map(|d| Body::ChunkAvailable {
                    file_id: d.file_id.clone(),
                    chunks: d.available.iter().copied().collect(),
                })
                .collect(),
            Role::Consumer => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::PeerIdentity;
    use crate::core::Config;
    use crate::network::memory::MemoryNetwork;
    use crate::core::protocol::FileId;
    use crate::network::transport::{Transport, TransportEvent};
    use crate::storage::{ChunkCipher, ChunkStore, FileDescriptor};
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    async fn discovery(
        network: &MemoryNetwork,
        role: Role,
    ) -> (Discovery, UnboundedReceiver<NodeEvent>) {
        let transport: Arc<dyn Transport> = Arc::new(network.endpoint().await);
        let (ctx, events) = NodeContext::new(Config::default(), role, transport).unwrap();
        (Discovery::new(ctx), events)
    }

    fn from() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_consumer_pins_first_session_start() {
        let network = MemoryNetwork::new();
        let (consumer, mut events) = discovery(&network, Role::Consumer).await;
        let teacher = PeerIdentity::create(Role::Source, "teacher", from());

        let start = teacher.sign(Body::Discovery { name: "teacher".into() }).unwrap();
        assert!(consumer.admit(&start, from()).await.unwrap());
        assert!(consumer.ctx.trust.read().await.cipher().is_some());
        assert_eq!(consumer.ctx.directory.read().await.len(), 1);

        let mut saw_source = false;
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::SourceFound { peer_id, name, .. } = event {
                assert_eq!(peer_id, teacher.id);
                assert_eq!(name, "teacher");
                saw_source = true;
            }
        }
        assert!(saw_source);
    }

    #[tokio::test]
    async fn test_source_traffic_waits_for_session_start() {
        let network = MemoryNetwork::new();
        let (consumer, _events) = discovery(&network, Role::Consumer).await;
        let teacher = PeerIdentity::create(Role::Source, "teacher", from());

        let early = teacher.sign(Body::Probe).unwrap();
        assert!(!consumer.admit(&early, from()).await.unwrap());
        assert!(consumer.ctx.trust.read().await.anchor().is_none());
        assert!(consumer.ctx.directory.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_source_is_rejected() {
        let network = MemoryNetwork::new();
        let (consumer, _events) = discovery(&network, Role::Consumer).await;
        let teacher = PeerIdentity::create(Role::Source, "teacher", from());
        let impostor = PeerIdentity::create(Role::Source, "teacher", from());

        let start = teacher.sign(Body::Discovery { name: "teacher".into() }).unwrap();
        consumer.admit(&start, from()).await.unwrap();

        let rogue = impostor.sign(Body::Discovery { name: "teacher".into() }).unwrap();
        assert!(matches!(
            consumer.admit(&rogue, from()).await,
            Err(ShareError::AuthenticationFailure(_))
        ));
        assert_eq!(consumer.ctx.metrics.snapshot().await.auth_failures, 1);
        assert_eq!(consumer.ctx.directory.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unsigned_source_claim_is_dropped() {
        let network = MemoryNetwork::new();
        let (consumer, _events) = discovery(&network, Role::Consumer).await;
        let mallory = PeerIdentity::create(Role::Consumer, "mallory", from());

        let mut forged = mallory.sign(Body::Discovery { name: "teacher".into() }).unwrap();
        forged.role = Role::Source;
        assert!(consumer.admit(&forged, from()).await.is_err());
        assert!(consumer.ctx.directory.read().await.is_empty());
        assert!(consumer.ctx.trust.read().await.anchor().is_none());
    }

    #[tokio::test]
    async fn test_own_echo_is_ignored() {
        let network = MemoryNetwork::new();
        let (node, _events) = discovery(&network, Role::Source).await;
        let echo = node.ctx.identity.sign(Body::Probe).unwrap();
        assert!(!node.admit(&echo, from()).await.unwrap());
    }

    #[tokio::test]
    async fn test_source_answers_probe_with_presence_and_files() {
        let network = MemoryNetwork::new();
        let (source, _events) = discovery(&network, Role::Source).await;
        let listener = network.endpoint().await;

        let cipher = source.ctx.trust.read().await.cipher().cloned().unwrap();
        let shared = source
            .ctx
            .store
            .write()
            .await
            .share("notes.txt", b"0123456789", 4, &cipher, 1)
            .unwrap();

        source.answer_probe(listener.local_addr()).await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..2 {
            let TransportEvent::Message { bytes, .. } = listener.recv().await else {
                panic!("expected a message");
            };
            let envelope = Envelope::decode(&bytes).unwrap();
            if let Body::Advertise(ad) = &envelope.body {
                assert_eq!(ad.file_id, shared.file_id);
                assert_eq!(ad.total_chunks, 3);
            }
            kinds.push(envelope.body.kind());
        }
        assert_eq!(kinds, vec!["discovery", "advertise"]);
    }

    #[tokio::test]
    async fn test_empty_consumer_stays_quiet() {
        let network = MemoryNetwork::new();
        let (consumer, _events) = discovery(&network, Role::Consumer).await;
        let _listener = network.endpoint().await;
        consumer.answer_probe("127.0.0.1:40001".parse().unwrap()).await.unwrap();
        assert_eq!(network.delivered().await, 0);
    }

    /// Gives `consumer` chunks 0 and 2 of a three chunk file.
    async fn hold_two_chunks(consumer: &Discovery) -> FileId {
        let cipher = ChunkCipher::derive("secret", &Uuid::new_v4()).unwrap();
        let mut source = ChunkStore::new();
        let shared = source.share("notes.txt", b"0123456789", 4, &cipher, 1).unwrap();

        let mut store = consumer.ctx.store.write().await;
        store.register(FileDescriptor::from_advertisement(&shared.advertisement()));
        for index in [0, 2] {
            let record = source.get(&shared.file_id, index).unwrap().clone();
            store.put(record).unwrap();
        }
        shared.file_id
    }

    #[tokio::test]
    async fn test_redistributing_consumer_answers_with_held_chunks() {
        let network = MemoryNetwork::new();
        let (consumer, _events) = discovery(&network, Role::Consumer).await;
        let listener = network.endpoint().await;
        let file_id = hold_two_chunks(&consumer).await;

        consumer.answer_probe(listener.local_addr()).await.unwrap();

        let mut kinds = Vec::new();
        for _ in 0..2 {
            let TransportEvent::Message { bytes, .. } = listener.recv().await else {
                panic!("expected a message");
            };
            let envelope = Envelope::decode(&bytes).unwrap();
            if let Body::ChunkAvailable { file_id: id, chunks } = &envelope.body {
                assert_eq!(id, &file_id);
                assert_eq!(chunks, &vec![0, 2]);
            }
            kinds.push(envelope.body.kind());
        }
        assert_eq!(kinds, vec!["discovery", "chunk_available"]);
    }

    #[tokio::test]
    async fn test_presence_tick_repeats_held_chunks() {
        let network = MemoryNetwork::new();
        let (consumer, _events) = discovery(&network, Role::Consumer).await;
        let listener = network.endpoint().await;
        hold_two_chunks(&consumer).await;

        consumer.announce().await.unwrap();
        let mut kinds = Vec::new();
        for _ in 0..2 {
            let TransportEvent::Message { bytes, .. } = listener.recv().await else {
                panic!("expected a message");
            };
            kinds.push(Envelope::decode(&bytes).unwrap().body.kind());
        }
        assert_eq!(kinds, vec!["discovery", "chunk_available"]);
    }

    #[tokio::test]
    async fn test_consumer_without_redistribute_keeps_chunks_to_itself() {
        let network = MemoryNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.endpoint().await);
        let config = Config {
            redistribute: false,
            ..Config::default()
        };
        let (ctx, _events) = NodeContext::new(config, Role::Consumer, transport).unwrap();
        let consumer = Discovery::new(ctx);
        let _listener = network.endpoint().await;
        hold_two_chunks(&consumer).await;

        consumer.answer_probe("127.0.0.1:40001".parse().unwrap()).await.unwrap();
        assert_eq!(network.delivered().await, 0);
    }
}
