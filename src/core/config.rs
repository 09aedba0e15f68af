use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::DEFAULT_CHUNK_SIZE;
use crate::utils::{Result, ShareError};

/// AES-GCM tag appended to every chunk.
const TAG_LEN: usize = 16;
/// Upper bound on a signed chunk-response envelope minus its hex ciphertext.
const ENVELOPE_OVERHEAD: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_name: String,
    pub bind_addr: String,
    pub port: u16,
    pub broadcast_addr: String,
    pub chunk_size: usize,
    pub broadcast_interval_ms: u64,
    pub staleness_ms: u64,
    pub sweep_interval_ms: u64,
    pub request_tick_ms: u64,
    pub completion_tick_ms: u64,
    pub request_timeout_ms: u64,
    pub download_timeout_ms: u64,
    /// Outbound bytes allowed per bandwidth window, `0` for unlimited.
    pub bandwidth_limit: u64,
    pub bandwidth_window_ms: u64,
    pub bandwidth_poll_ms: u64,
    /// Pre-shared secret the chunk key is derived from.
    pub session_secret: String,
    pub download_dir: PathBuf,
    pub auto_download: bool,
    pub redistribute: bool,
    pub max_datagram: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "labshare".to_string(),
            bind_addr: "0.0.0.0".to_string(),
            port: 6881,
            broadcast_addr: "255.255.255.255".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            broadcast_interval_ms: 5_000,
            staleness_ms: 15_000,
            sweep_interval_ms: 1_000,
            request_tick_ms: 100,
            completion_tick_ms: 1_000,
            request_timeout_ms: 5_000,
            download_timeout_ms: 5 * 60 * 1_000,
            bandwidth_limit: 1024 * 1024,
            bandwidth_window_ms: 1_000,
            bandwidth_poll_ms: 100,
            session_secret: "labshare".to_string(),
            download_dir: PathBuf::from("./downloads"),
            auto_download: true,
            redistribute: true,
            max_datagram: 65_507,
        }
    }
}

impl Config {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ShareError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| ShareError::ConfigError(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ShareError::ConfigError("chunk_size must be > 0".into()));
        }
        if self.chunk_size > self.max_chunk_size() {
            return Err(ShareError::ConfigError(format!(
                "chunk_size {} does not fit a {} byte datagram (max {})",
                self.chunk_size,
                self.max_datagram,
                self.max_chunk_size()
            )));
        }
        let ticks = [
            ("broadcast_interval_ms", self.broadcast_interval_ms),
            ("staleness_ms", self.staleness_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("request_tick_ms", self.request_tick_ms),
            ("completion_tick_ms", self.completion_tick_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("download_timeout_ms", self.download_timeout_ms),
            ("bandwidth_window_ms", self.bandwidth_window_ms),
            ("bandwidth_poll_ms", self.bandwidth_poll_ms),
        ];
        for (name, value) in ticks {
            if value == 0 {
                return Err(ShareError::ConfigError(format!("{} must be > 0", name)));
            }
        }
        if self.session_secret.is_empty() {
            return Err(ShareError::ConfigError("session_secret is empty".into()));
        }
        Ok(())
    }

    /// Largest chunk whose hex-encoded response still fits in one datagram.
    pub fn max_chunk_size(&self) -> usize {
        (self.max_datagram.saturating_sub(ENVELOPE_OVERHEAD) / 2).saturating_sub(TAG_LEN)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn request_tick(&self) -> Duration {
        Duration::from_millis(self.request_tick_ms)
    }

    pub fn completion_tick(&self) -> Duration {
        Duration::from_millis(self.completion_tick_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn bandwidth_window(&self) -> Duration {
        Duration::from_millis(self.bandwidth_window_ms)
    }

    pub fn bandwidth_poll(&self) -> Duration {
        Duration::from_millis(self.bandwidth_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::PeerIdentity;
    use crate::core::protocol::{Body, Role};
    use crate::storage::{ChunkCipher, HashUtils};
    use uuid::Uuid;

    #[test]
    fn test_defaults_match_reference_timings() {
        let config = Config::default();
        assert_eq!(config.broadcast_interval(), Duration::from_secs(5));
        assert_eq!(config.staleness(), Duration::from_secs(15));
        assert_eq!(config.request_tick(), Duration::from_millis(100));
        assert_eq!(config.completion_tick(), Duration::from_secs(1));
        assert_eq!(config.download_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config = serde_json::from_str(r#"{"chunk_size": 4, "port": 7000}"#).unwrap();
        assert_eq!(config.chunk_size, 4);
        assert_eq!(config.port, 7000);
        assert_eq!(config.staleness_ms, 15_000);
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ShareError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_chunks_larger_than_a_datagram() {
        let config = Config {
            chunk_size: 40_000,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ShareError::ConfigError(_))));

        let config = Config {
            chunk_size: Config::default().max_chunk_size(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_largest_chunk_response_fits_datagram() {
        let config = Config::default();
        let address = "10.0.0.1:6881".parse().unwrap();
        let source = PeerIdentity::create(Role::Source, "teacher", address);
        let cipher = ChunkCipher::derive(&config.session_secret, &Uuid::new_v4()).unwrap();
        let file_id = HashUtils::file_id("a-rather-long-lecture-file-name.pdf", u64::MAX, i64::MAX);

        let plaintext = vec![0xEE; config.max_chunk_size()];
        let payload = cipher
            .encrypt(&file_id, u32::MAX, &plaintext)
            .unwrap()
            .into_payload(file_id, u32::MAX);
        let bytes = source.sign(Body::ChunkResponse(payload)).unwrap().encode().unwrap();
        assert!(bytes.len() <= config.max_datagram, "{} bytes", bytes.len());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labshare.json");
        std::fs::write(&path, r#"{"node_name": "lab-3", "request_tick_ms": 50}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node_name, "lab-3");
        assert_eq!(config.request_tick(), Duration::from_millis(50));
    }
}
