use async_trait::async_trait;
use log::info;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::protocol::FileId;
use crate::utils::{Result, ShareError};

/// Where assembled files end up. Called once per completed download.
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn write_assembled_file(&self, file_id: &FileId, name: &str, bytes: &[u8])
        -> Result<PathBuf>;
}

/// Writes files under a download directory.
pub struct DiskSink {
    base_dir: PathBuf,
}

impl DiskSink {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Keep only the final path component so a remote name cannot escape
    /// the download directory.
    fn target_path(&self, file_id: &FileId, name: &str) -> PathBuf {
        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty() && n != "." && n != "..")
            .unwrap_or_else(|| file_id.to_string());
        self.base_dir.join(file_name)
    }
}

#[async_trait]
impl FileSink for DiskSink {
    async fn write_assembled_file(
        &self,
        file_id: &FileId,
        name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        async_fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| ShareError::IoError(format!("Failed to create directory: {}", e)))?;

        let path = self.target_path(file_id, name);
        let mut file = async_fs::File::create(&path)
            .await
            .map_err(|e| ShareError::IoError(format!("Failed to create output file: {}", e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| ShareError::IoError(format!("Failed to write file: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| ShareError::IoError(format!("Failed to flush file: {}", e)))?;

        info!("File written: {:?} ({} bytes)", path, bytes.len());
        Ok(path)
    }
}

/// Keeps assembled files in memory, keyed by file id.
#[derive(Clone, Default)]
pub struct MemorySink {
    files: Arc<Mutex<HashMap<FileId, (String, Vec<u8>)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, file_id: &FileId) -> Option<(String, Vec<u8>)> {
        self.files.lock().await.get(file_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.files.lock().await.len()
    }
}

#[async_trait]
impl FileSink for MemorySink {
    async fn write_assembled_file(
        &self,
        file_id: &FileId,
        name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        self.files
            .lock()
            .await
            .insert(file_id.clone(), (name.to_string(), bytes.to_vec()));
        Ok(PathBuf::from(format!("memory://{}/{}", file_id, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disk_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiskSink::new(dir.path().join("downloads"));
        let file_id = FileId::new("abc");

        let path = sink
            .write_assembled_file(&file_id, "notes.txt", b"hello")
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("downloads").join("notes.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_disk_sink_strips_directories_from_name() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiskSink::new(dir.path().to_path_buf());
        let file_id = FileId::new("abc");

        let path = sink
            .write_assembled_file(&file_id, "../../etc/passwd", b"x")
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("passwd"));

        let path = sink.write_assembled_file(&file_id, "..", b"x").await.unwrap();
        assert_eq!(path, dir.path().join("abc"));
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_bytes() {
        let sink = MemorySink::new();
        let file_id = FileId::new("f");
        sink.write_assembled_file(&file_id, "a", b"123").await.unwrap();
        assert_eq!(sink.get(&file_id).await.unwrap(), ("a".to_string(), b"123".to_vec()));
        assert_eq!(sink.len().await, 1);
    }
}
