pub mod chunk;
pub mod chunk_store;
pub mod file_sink;
pub mod hash;

pub use chunk::{split, ChunkCipher, ChunkRecord, EncryptedChunk, DEFAULT_CHUNK_SIZE};
pub use chunk_store::{ChunkStore, FileDescriptor};
pub use file_sink::{DiskSink, FileSink, MemorySink};
pub use hash::HashUtils;
