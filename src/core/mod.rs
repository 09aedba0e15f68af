pub mod config;
pub mod events;
pub mod identity;
pub mod node;
pub mod peer;
pub mod protocol;

pub use config::Config;
pub use events::{EventSink, NodeEvent};
pub use identity::{PeerIdentity, TrustAnchor, TrustState};
pub use node::{Node, NodeContext};
pub use peer::{PeerDirectory, PeerRecord};
pub use protocol::{Advertisement, Body, ChunkPayload, Envelope, FileId, PeerId, Role};
