use log::{debug, info};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use tokio::time::{Duration, Instant};

use crate::core::events::{EventSink, NodeEvent};
use crate::core::protocol::{FileId, PeerId, Role};
use crate::utils::{Result, ShareError};

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub address: SocketAddr,
    pub role: Role,
    pub last_seen: Instant,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
}

impl PeerRecord {
    /// `successes / requests`, or `None` while the peer is unproven.
    pub fn quality(&self) -> Option<f64> {
        if self.request_count == 0 {
            None
        } else {
            Some(self.success_count as f64 / self.request_count as f64)
        }
    }

    /// Proven peers first, best ratio first; unproven peers last.
    fn rank_cmp(&self, other: &PeerRecord) -> Ordering {
        match (self.request_count, other.request_count) {
            (0, 0) => Ordering::Equal,
            (0, _) => Ordering::Greater,
            (_, 0) => Ordering::Less,
            (a_req, b_req) => {
                // a_succ/a_req > b_succ/b_req without floating point
                let lhs = self.success_count as u128 * b_req as u128;
                let rhs = other.success_count as u128 * a_req as u128;
                rhs.cmp(&lhs)
            }
        }
        .then_with(|| self.peer_id.cmp(&other.peer_id))
    }
}

#[derive(Debug, Clone)]
enum Holding {
    /// Advertised the whole file (a source).
    All,
    Chunks(BTreeSet<u32>),
}

impl Holding {
    fn holds(&self, index: u32) -> bool {
        match self {
            Holding::All => true,
            Holding::Chunks(set) => set.contains(&index),
        }
    }
}

/// Known peers, their rolling request statistics and which chunks each has
/// advertised or supplied.
pub struct PeerDirectory {
    local_id: PeerId,
    staleness: Duration,
    peers: HashMap<PeerId, PeerRecord>,
    holdings: HashMap<FileId, HashMap<PeerId, Holding>>,
    events: EventSink,
}

impl PeerDirectory {
    pub fn new(local_id: PeerId, staleness: Duration, events: EventSink) -> Self {
        Self {
            local_id,
            staleness,
            peers: HashMap::new(),
            holdings: HashMap::new(),
            events,
        }
    }

    /// Insert or refresh a peer. Returns `true` for a newly discovered peer.
    pub fn observe(
        &mut self,
        peer_id: PeerId,
        address: SocketAddr,
        role: Role,
        now: Instant,
    ) -> bool {
        if peer_id == self.local_id {
            return false;
        }

        if let Some(record) = self.peers.get_mut(&peer_id) {
            record.address = address;
            record.role = role;
            record.last_seen = now;
            return false;
        }

        self.peers.insert(
            peer_id,
            PeerRecord {
                peer_id,
                address,
                role,
                last_seen: now,
                request_count: 0,
                success_count: 0,
                failure_count: 0,
            },
        );
        info!(
            "Discovered {} peer {} at {} ({})",
            role,
            peer_id.short(),
            address,
            self.peers.len()
        );
        self.events.emit(NodeEvent::PeerDiscovered {
            peer_id,
            role,
            address,
        });
        true
    }

    pub fn record_outcome(&mut self, peer_id: &PeerId, success: bool) {
        if let Some(record) = self.peers.get_mut(peer_id) {
            record.request_count += 1;
            if success {
                record.success_count += 1;
            } else {
                record.failure_count += 1;
            }
            debug!(
                "Peer {} outcome {}: {}/{} ok",
                peer_id.short(),
                if success { "success" } else { "failure" },
                record.success_count,
                record.request_count
            );
        }
    }

    /// The peer advertised the whole file.
    pub fn record_holds_all(&mut self, peer_id: PeerId, file_id: &FileId) {
        if peer_id == self.local_id {
            return;
        }
        self.holdings
            .entry(file_id.clone())
            .or_default()
            .insert(peer_id, Holding::All);
    }

    /// The peer advertised, or just supplied, these chunks.
    pub fn record_holds(&mut self, peer_id: PeerId, file_id: &FileId, chunks: &[u32]) {
        if peer_id == self.local_id || chunks.is_empty() {
            return;
        }
        let holding = self
            .holdings
            .entry(file_id.clone())
            .or_default()
            .entry(peer_id)
            .or_insert_with(|| Holding::Chunks(BTreeSet::new()));
        if let Holding::Chunks(set) = holding {
            set.extend(chunks.iter().copied());
        }
    }

    /// Peers known to hold the chunk, best quality first, unproven last.
    pub fn rank_for_chunk(&self, file_id: &FileId, chunk_index: u32) -> Vec<PeerId> {
        let Some(holders) = self.holdings.get(file_id) else {
            return Vec::new();
        };

        let mut candidates: Vec<&PeerRecord> = holders
            .iter()
            .filter(|(_, holding)| holding.holds(chunk_index))
            .filter_map(|(peer_id, _)| self.peers.get(peer_id))
            .collect();
        candidates.sort_by(|a, b| a.rank_cmp(b));
        candidates.into_iter().map(|r| r.peer_id).collect()
    }

    /// Highest ranked holder not in `avoid`, with its address.
    pub fn best_source(
        &self,
        file_id: &FileId,
        chunk_index: u32,
        avoid: &BTreeSet<PeerId>,
    ) -> Result<(PeerId, SocketAddr)> {
        self.rank_for_chunk(file_id, chunk_index)
            .into_iter()
            .find(|id| !avoid.contains(id))
            .and_then(|id| self.peers.get(&id))
            .map(|r| (r.peer_id, r.address))
            .ok_or_else(|| ShareError::NoCandidatePeer {
                file_id: file_id.to_string(),
                index: chunk_index,
            })
    }

    /// Evict peers silent for longer than the staleness threshold.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let staleness = self.staleness;
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen) > staleness)
            .map(|r| r.peer_id)
            .collect();

        for peer_id in &stale {
            self.peers.remove(peer_id);
            for holders in self.holdings.values_mut() {
                holders.remove(peer_id);
            }
            info!("Peer {} went silent, evicted ({})", peer_id.short(), self.peers.len());
            self.events.emit(NodeEvent::PeerLost { peer_id: *peer_id });
        }

        stale
    }

    pub fn forget_file(&mut self, file_id: &FileId) {
        self.holdings.remove(file_id);
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
