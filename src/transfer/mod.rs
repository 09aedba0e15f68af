pub mod downloader;
pub mod scheduler;
pub mod session;
pub mod uploader;

pub use downloader::{DownloadProgress, Downloader};
pub use scheduler::{ChunkScheduler, DownloadState, RequestTarget};
pub use session::{SessionState, SessionTable, TransferSession};
pub use uploader::Uploader;
