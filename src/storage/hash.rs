use sha2::{Digest, Sha256};

use crate::core::protocol::FileId;

pub struct HashUtils;

impl HashUtils {
    pub fn hash_data(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    pub fn verify_data(data: &[u8], expected_hash: &str) -> bool {
        Self::hash_data(data) == expected_hash
    }

    /// Derive a file id from name, size and creation time (ms). Two shares
    /// of the same file at different times get different ids.
    pub fn file_id(name: &str, size: u64, created_at: i64) -> FileId {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(size.to_be_bytes());
        hasher.update(created_at.to_be_bytes());
        FileId::new(hex::encode(&hasher.finalize()[..16]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = HashUtils::hash_data(b"hello");
        assert_eq!(hash.len(), 64);
        assert!(HashUtils::verify_data(b"hello", &hash));
        assert!(!HashUtils::verify_data(b"hellp", &hash));
    }

    #[test]
    fn test_file_id_depends_on_every_input() {
        let base = HashUtils::file_id("notes.pdf", 10, 1000);
        assert_eq!(base, HashUtils::file_id("notes.pdf", 10, 1000));
        assert_ne!(base, HashUtils::file_id("notes.pdf", 11, 1000));
        assert_ne!(base, HashUtils::file_id("notes.pdf", 10, 1001));
        assert_ne!(base, HashUtils::file_id("notes.pdg", 10, 1000));
        assert_eq!(base.as_str().len(), 32);
    }
}
