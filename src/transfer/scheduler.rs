use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use tokio::time::{Duration, Instant};

use crate::core::peer::PeerDirectory;
use crate::core::protocol::{FileId, PeerId};
use crate::storage::FileDescriptor;
use crate::utils::ShareError;

/// Distance of a chunk from the nearest end of the file. Head and tail
/// chunks get `0` and are requested first.
pub fn default_priority(index: u32, total_chunks: u32) -> u64 {
    let from_end = total_chunks.saturating_sub(1).saturating_sub(index);
    index.min(from_end) as u64
}

/// Where a chunk request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTarget {
    Peer { peer_id: PeerId, address: SocketAddr },
    /// Nobody is known to hold the chunk; ask everyone.
    Broadcast,
}

/// Chunk ordering and source selection.
pub struct ChunkScheduler;

impl ChunkScheduler {
    pub fn priority(descriptor: &FileDescriptor, index: u32) -> Option<u64> {
        descriptor.priorities.get(index as usize).copied()
    }

    /// Override one chunk's priority. Lower values are requested sooner.
    pub fn set_priority(descriptor: &mut FileDescriptor, index: u32, priority: u64) {
        if let Some(slot) = descriptor.priorities.get_mut(index as usize) {
            *slot = priority;
        }
    }

    /// Push a just-requested chunk behind every chunk not yet requested this
    /// round, so the loop does not hammer one index.
    pub fn deprioritize(descriptor: &mut FileDescriptor, index: u32) {
        let step = descriptor.total_chunks.max(1) as u64;
        if let Some(slot) = descriptor.priorities.get_mut(index as usize) {
            *slot = slot.saturating_add(step);
        }
    }

    /// Best missing chunk: lowest priority value, ties to the lowest index.
    pub fn next_chunk(descriptor: &FileDescriptor, received: &BTreeSet<u32>) -> Option<u32> {
        (0..descriptor.total_chunks)
            .filter(|index| !received.contains(index))
            .min_by_key(|index| {
                let priority = descriptor
                    .priorities
                    .get(*index as usize)
                    .copied()
                    .unwrap_or(u64::MAX);
                (priority, *index)
            })
    }

    /// Best ranked holder not in `avoid`. Once every holder has failed this
    /// chunk, the request goes to everyone.
    pub fn pick_source(
        directory: &PeerDirectory,
        file_id: &FileId,
        index: u32,
        avoid: &BTreeSet<PeerId>,
    ) -> RequestTarget {
        match directory.best_source(file_id, index, avoid) {
            Ok((peer_id, address)) => RequestTarget::Peer { peer_id, address },
            Err(e @ ShareError::NoCandidatePeer { .. }) => {
                debug!("{}, broadcasting request", e);
                RequestTarget::Broadcast
            }
            Err(_) => RequestTarget::Broadcast,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub chunk_index: u32,
    pub requested_at: Instant,
    pub peer_id: Option<PeerId>,
}

/// Consumer-side progress of one download.
#[derive(Debug)]
pub struct DownloadState {
    pub file_id: FileId,
    pub total_chunks: u32,
    pub received: BTreeSet<u32>,
    pub in_flight: HashMap<u32, ChunkRequest>,
    pub bytes_received: u64,
    pub started_at: Instant,
    pub deadline: Instant,
    /// Size of the held set at the last chunk-available announcement.
    pub announced: usize,
    /// Peers that let a request for the chunk time out or sent it corrupted.
    pub tried: HashMap<u32, BTreeSet<PeerId>>,
}

impl DownloadState {
    pub fn new(file_id: FileId, total_chunks: u32, timeout: Duration, now: Instant) -> Self {
        Self {
            file_id,
            total_chunks,
            received: BTreeSet::new(),
            in_flight: HashMap::new(),
            bytes_received: 0,
            started_at: now,
            deadline: now + timeout,
            announced: 0,
            tried: HashMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u64 == self.total_chunks as u64
    }

    /// A broadcast request gives every holder a fresh chance at the chunk.
    pub fn mark_requested(&mut self, chunk_index: u32, peer_id: Option<PeerId>, now: Instant) {
        if peer_id.is_none() {
            self.tried.remove(&chunk_index);
        }
        self.in_flight.insert(
            chunk_index,
            ChunkRequest {
                chunk_index,
                requested_at: now,
                peer_id,
            },
        );
    }

    /// Record a verified chunk. Returns `false` if it was already received.
    pub fn mark_received(&mut self, chunk_index: u32, bytes: usize) -> bool {
        if chunk_index >= self.total_chunks || !self.received.insert(chunk_index) {
            return false;
        }
        self.in_flight.remove(&chunk_index);
        self.tried.remove(&chunk_index);
        self.bytes_received += bytes as u64;
        true
    }

    /// Forget a request answered with a corrupt chunk; the chunk is asked
    /// for again, from someone other than `from` if possible.
    pub fn mark_failed(&mut self, chunk_index: u32, from: PeerId) -> Option<ChunkRequest> {
        self.tried.entry(chunk_index).or_default().insert(from);
        self.in_flight.remove(&chunk_index)
    }

    /// Drop requests older than `timeout`; returns the peers they were
    /// addressed to so their failure counters can be bumped.
    pub fn expire_requests(&mut self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let stale: Vec<u32> = self
            .in_flight
            .values()
            .filter(|r| now.saturating_duration_since(r.requested_at) > timeout)
            .map(|r| r.chunk_index)
            .collect();

        let mut failed = Vec::new();
        for index in stale {
            if let Some(peer_id) = self.in_flight.remove(&index).and_then(|r| r.peer_id) {
                self.tried.entry(index).or_default().insert(peer_id);
                failed.push(peer_id);
            }
        }
        failed
    }
}
