pub mod discovery;
pub mod memory;
pub mod messaging;
pub mod transport;

pub use discovery::Discovery;
pub use memory::{Interceptor, MemoryNetwork, MemoryTransport};
pub use messaging::Messenger;
pub use transport::{Destination, Transport, TransportEvent, UdpTransport};
