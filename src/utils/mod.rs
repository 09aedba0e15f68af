pub mod error;
pub mod logger;
pub mod metrics;
pub mod rate_limiter;

pub use error::{Result, ShareError};
pub use logger::setup_logging;
pub use metrics::{MetricsCollector, TransferMetrics};
pub use rate_limiter::BandwidthWindow;
