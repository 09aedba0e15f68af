//! labshare
//!
//! LAN file distribution for a classroom: one signed source splits each file
//! into encrypted chunks and consumers fetch them over UDP, center-out, from
//! the source or from each other.

pub mod core;
pub mod network;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use core::{Config, FileId, Node, NodeEvent, PeerId, Role};
pub use network::{MemoryNetwork, Transport, UdpTransport};
pub use storage::{DiskSink, FileSink, MemorySink};
pub use transfer::{DownloadProgress, SessionState};
pub use utils::{
    error::{Result, ShareError},
    setup_logging,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
