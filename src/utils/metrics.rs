use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct TransferMetrics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub auth_failures: u64,
    pub integrity_failures: u64,
    pub files_shared: u64,
    pub files_downloaded: u64,
    pub chunks_uploaded: u64,
    pub chunks_downloaded: u64,
    pub uptime: Duration,
    pub start_time: Instant,
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            messages_dropped: 0,
            auth_failures: 0,
            integrity_failures: 0,
            files_shared: 0,
            files_downloaded: 0,
            chunks_uploaded: 0,
            chunks_downloaded: 0,
            uptime: Duration::new(0, 0),
            start_time: Instant::now(),
        }
    }
}

#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<TransferMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_sent(&self, bytes: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.bytes_sent += bytes;
        metrics.messages_sent += 1;
    }

    pub async fn record_received(&self, bytes: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.bytes_received += bytes;
        metrics.messages_received += 1;
    }

    pub async fn record_dropped(&self) {
        self.metrics.write().await.messages_dropped += 1;
    }

    pub async fn record_auth_failure(&self) {
        self.metrics.write().await.auth_failures += 1;
    }

    pub async fn record_integrity_failure(&self) {
        self.metrics.write().await.integrity_failures += 1;
    }

    pub async fn record_file_shared(&self) {
        self.metrics.write().await.files_shared += 1;
    }

    pub async fn record_file_downloaded(&self) {
        self.metrics.write().await.files_downloaded += 1;
    }

    pub async fn record_chunk_uploaded(&self) {
        self.metrics.write().await.chunks_uploaded += 1;
    }

    pub async fn record_chunk_downloaded(&self) {
        self.metrics.write().await.chunks_downloaded += 1;
    }

    pub async fn snapshot(&self) -> TransferMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.uptime = metrics.start_time.elapsed();
        metrics
    }

    pub async fn log_summary(&self) {
        let m = self.snapshot().await;

        info!(
            "uptime {:.2?} | sent {} msgs / {} bytes | received {} msgs / {} bytes | dropped {}",
            m.uptime, m.messages_sent, m.bytes_sent, m.messages_received, m.bytes_received,
            m.messages_dropped
        );
        info!(
            "files {} shared, {} downloaded | chunks {} uploaded, {} downloaded | auth failures {}, integrity failures {}",
            m.files_shared,
            m.files_downloaded,
            m.chunks_uploaded,
            m.chunks_downloaded,
            m.auth_failures,
            m.integrity_failures
        );
    }
}
