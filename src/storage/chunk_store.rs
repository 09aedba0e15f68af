use log::{debug, info};
use std::collections::{BTreeSet, HashMap};

use crate::core::protocol::{Advertisement, FileId};
use crate::storage::chunk::{split, ChunkCipher, ChunkRecord};
use crate::storage::HashUtils;
use crate::transfer::scheduler::default_priority;
use crate::utils::{Result, ShareError};

/// Metadata of one shared file.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
    pub file_hash: String,
    /// Request order key per chunk index; lower is requested sooner.
    pub priorities: Vec<u64>,
    /// Indices this node holds.
    pub available: BTreeSet<u32>,
}

impl FileDescriptor {
    pub fn from_advertisement(ad: &Advertisement) -> Self {
        Self {
            file_id: ad.file_id.clone(),
            name: ad.name.clone(),
            size: ad.size,
            total_chunks: ad.total_chunks,
            file_hash: ad.file_hash.clone(),
            priorities: (0..ad.total_chunks)
                .map(|i| default_priority(i, ad.total_chunks))
                .collect(),
            available: BTreeSet::new(),
        }
    }

    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            file_id: self.file_id.clone(),
            name: self.name.clone(),
            size: self.size,
            total_chunks: self.total_chunks,
            file_hash: self.file_hash.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.available.len() as u64 == self.total_chunks as u64
    }
}

/// Encrypted chunks keyed by `(file id, chunk index)` plus the descriptors
/// of the files they belong to.
#[derive(Default)]
pub struct ChunkStore {
    files: HashMap<FileId, FileDescriptor>,
    chunks: HashMap<(FileId, u32), ChunkRecord>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split, encrypt and store a local file. The returned descriptor holds
    /// every chunk.
    pub fn share(
        &mut self,
        name: &str,
        content: &[u8],
        chunk_size: usize,
        cipher: &ChunkCipher,
        created_at: i64,
    ) -> Result<FileDescriptor> {
        let size = content.len() as u64;
        let file_id = HashUtils::file_id(name, size, created_at);
        let ranges = split(content.len(), chunk_size);
        let total_chunks = u32::try_from(ranges.len())
            .map_err(|_| ShareError::ConfigError(format!("{} has too many chunks", name)))?;

        for (index, range) in ranges.into_iter().enumerate() {
            let record = cipher.seal(&file_id, index as u32, &content[range])?;
            self.chunks.insert((file_id.clone(), index as u32), record);
        }

        let mut descriptor = FileDescriptor::from_advertisement(&Advertisement {
            file_id: file_id.clone(),
            name: name.to_string(),
            size,
            total_chunks,
            file_hash: HashUtils::hash_data(content),
        });
        descriptor.available = (0..total_chunks).collect();

        info!(
            "Stored {} as {} ({} bytes, {} chunks of {})",
            name, file_id, size, total_chunks, chunk_size
        );
        self.files.insert(file_id, descriptor.clone());
        Ok(descriptor)
    }

    /// Track a remote file. Returns `false` if it was already known.
    pub fn register(&mut self, descriptor: FileDescriptor) -> bool {
        if self.files.contains_key(&descriptor.file_id) {
            return false;
        }
        self.files.insert(descriptor.file_id.clone(), descriptor);
        true
    }

    /// Store a verified chunk. Stored chunks are never replaced; returns
    /// `false` for a duplicate.
    pub fn put(&mut self, record: ChunkRecord) -> Result<bool> {
        let descriptor = self
            .files
            .get_mut(&record.file_id)
            .ok_or_else(|| ShareError::FileNotFound(record.file_id.to_string()))?;
        if record.index >= descriptor.total_chunks {
            return Err(ShareError::ChunkNotFound(format!(
                "{}#{} (file has {} chunks)",
                record.file_id, record.index, descriptor.total_chunks
            )));
        }

        let key = (record.file_id.clone(), record.index);
        if self.chunks.contains_key(&key) {
            return Ok(false);
        }

        descriptor.available.insert(record.index);
        debug!("Stored chunk {}#{}", record.file_id, record.index);
        self.chunks.insert(key, record);
        Ok(true)
    }

    pub fn get(&self, file_id: &FileId, index: u32) -> Option<&ChunkRecord> {
        self.chunks.get(&(file_id.clone(), index))
    }

    pub fn has(&self, file_id: &FileId, index: u32) -> bool {
        self.chunks.contains_key(&(file_id.clone(), index))
    }

    pub fn held_indices(&self, file_id: &FileId) -> Vec<u32> {
        self.files
            .get(file_id)
            .map(|d| d.available.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Decrypt and concatenate chunks `0..total_chunks` in order.
    pub fn assemble(&self, file_id: &FileId, cipher: &ChunkCipher) -> Result<Vec<u8>> {
        let descriptor = self
            .files
            .get(file_id)
            .ok_or_else(|| ShareError::FileNotFound(file_id.to_string()))?;

        let mut content = Vec::with_capacity(descriptor.size as usize);
        for index in 0..descriptor.total_chunks {
            let record = self
                .get(file_id, index)
                .ok_or_else(|| ShareError::IncompleteFile {
                    file_id: file_id.to_string(),
                    missing: index,
                })?;
            content.extend_from_slice(&cipher.decrypt(file_id, index, &record.chunk)?);
        }
        Ok(content)
    }

    pub fn descriptor(&self, file_id: &FileId) -> Option<&FileDescriptor> {
        self.files.get(file_id)
    }

    pub fn descriptor_mut(&mut self, file_id: &FileId) -> Option<&mut FileDescriptor> {
        self.files.get_mut(file_id)
    }

    pub fn descriptors(&self) -> Vec<&FileDescriptor> {
        self.files.values().collect()
    }

    /// Drop a file and all its chunks.
    pub fn remove_file(&mut self, file_id: &FileId) -> Option<FileDescriptor> {
        let descriptor = self.files.remove(file_id)?;
        self.chunks.retain(|(id, _), _| id != file_id);
        debug!("Removed {} from chunk store", file_id);
        Some(descriptor)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
