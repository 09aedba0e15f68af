use log::trace;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::protocol::{FileId, PeerId, Role};

/// Everything the application can observe about a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    PeerDiscovered {
        peer_id: PeerId,
        role: Role,
        address: SocketAddr,
    },
    PeerLost {
        peer_id: PeerId,
    },
    SourceFound {
        peer_id: PeerId,
        name: String,
        session_id: Uuid,
    },
    FileAvailable {
        file_id: FileId,
        name: String,
        size: u64,
    },
    DownloadProgress {
        file_id: FileId,
        received: u32,
        total: u32,
    },
    DownloadComplete {
        file_id: FileId,
        location: PathBuf,
    },
    DownloadFailed {
        file_id: FileId,
        reason: String,
    },
}

/// Sending half handed to every component that emits events.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: NodeEvent) {
        // The application may have dropped its receiver; that is not an error.
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}
