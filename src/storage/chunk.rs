use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::ops::Range;
use uuid::Uuid;

use crate::core::protocol::{ChunkPayload, FileId};
use crate::storage::HashUtils;
use crate::utils::{Result, ShareError};

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const IV_LEN: usize = 12;

const KEY_INFO: &[u8] = b"labshare/chunk-key/aes-256-gcm/v1";

/// Byte ranges of consecutive chunks covering `len` bytes. The last range may
/// be shorter than `chunk_size`; an empty file has no chunks.
pub fn split(len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let chunk_size = chunk_size.max(1);
    (0..len)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(len))
        .collect()
}

/// An encrypted chunk as stored and sent: IV plus AES-GCM ciphertext and tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedChunk {
    #[serde(with = "hex::serde")]
    pub iv: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedChunk {
    pub fn into_payload(self, file_id: FileId, chunk_index: u32) -> ChunkPayload {
        ChunkPayload {
            file_id,
            chunk_index,
            iv: self.iv,
            ciphertext: self.ciphertext,
        }
    }

    pub fn from_payload(payload: &ChunkPayload) -> Self {
        Self {
            iv: payload.iv.clone(),
            ciphertext: payload.ciphertext.clone(),
        }
    }
}

/// A stored chunk. Immutable once created.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub file_id: FileId,
    pub index: u32,
    pub chunk: EncryptedChunk,
    /// SHA-256 of the plaintext.
    pub content_hash: String,
}

/// AES-256-GCM under the session key. The file id and chunk index are bound
/// as associated data so a valid chunk cannot be replayed at another
/// position or in another file.
#[derive(Clone)]
pub struct ChunkCipher {
    key: [u8; 32],
}

impl ChunkCipher {
    /// Session key = HKDF-SHA256(secret, salt = session id).
    pub fn derive(secret: &str, session_id: &Uuid) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(&session_id.as_bytes()[..]), secret.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| ShareError::CryptoError(format!("Key derivation failed: {}", e)))?;
        Ok(Self { key })
    }

    pub fn encrypt(
        &self,
        file_id: &FileId,
        index: u32,
        plaintext: &[u8],
    ) -> Result<EncryptedChunk> {
        let cipher = self.cipher()?;
        let iv: [u8; IV_LEN] = rand::random();
        let aad = associated_data(file_id, index);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| ShareError::CryptoError(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedChunk {
            iv: iv.to_vec(),
            ciphertext,
        })
    }

    /// Authenticated decryption. Any mismatch is a whole-chunk failure.
    pub fn decrypt(&self, file_id: &FileId, index: u32, chunk: &EncryptedChunk) -> Result<Vec<u8>> {
        let integrity = || ShareError::ChunkIntegrityFailure {
            file_id: file_id.to_string(),
            index,
        };

        if chunk.iv.len() != IV_LEN {
            return Err(integrity());
        }

        let aad = associated_data(file_id, index);
        self.cipher()?
            .decrypt(
                Nonce::from_slice(&chunk.iv),
                Payload {
                    msg: &chunk.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| integrity())
    }

    /// Encrypt one plaintext chunk into a record ready for the store.
    pub fn seal(&self, file_id: &FileId, index: u32, plaintext: &[u8]) -> Result<ChunkRecord> {
        Ok(ChunkRecord {
            file_id: file_id.clone(),
            index,
            chunk: self.encrypt(file_id, index, plaintext)?,
            content_hash: HashUtils::hash_data(plaintext),
        })
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| ShareError::CryptoError(format!("Invalid key: {}", e)))
    }
}

fn associated_data(file_id: &FileId, index: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(file_id.as_str().len() + 5);
    aad.extend_from_slice(file_id.as_str().as_bytes());
    aad.push(b'#');
    aad.extend_from_slice(&index.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ChunkCipher {
        ChunkCipher::derive("secret", &Uuid::new_v4()).unwrap()
    }

    #[test]
    fn test_split_ten_bytes_by_four() {
        let ranges = split(10, 4);
        let sizes: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_split_concatenates_back() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for chunk_size in [1, 7, 64, 999, 1000, 4096] {
            let rebuilt: Vec<u8> = split(data.len(), chunk_size)
                .into_iter()
                .flat_map(|r| data[r].to_vec())
                .collect();
            assert_eq!(rebuilt, data, "chunk_size {}", chunk_size);
        }
    }

    #[test]
    fn test_split_edges() {
        assert!(split(0, 4).is_empty());
        assert_eq!(split(8, 4).len(), 2);
        assert_eq!(split(3, 4), vec![0..3]);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = cipher();
        let file = FileId::new("f");
        let sealed = cipher.encrypt(&file, 3, b"chunk bytes").unwrap();
        assert_eq!(sealed.iv.len(), IV_LEN);
        assert_eq!(cipher.decrypt(&file, 3, &sealed).unwrap(), b"chunk bytes");
    }

    #[test]
    fn test_tampering_fails_decryption() {
        let cipher = cipher();
        let file = FileId::new("f");
        let sealed = cipher.encrypt(&file, 0, b"important").unwrap();

        for i in 0..sealed.ciphertext.len() {
            let mut bad = sealed.clone();
            bad.ciphertext[i] ^= 0x01;
            assert!(cipher.decrypt(&file, 0, &bad).is_err());
        }
        for i in 0..IV_LEN {
            let mut bad = sealed.clone();
            bad.iv[i] ^= 0x80;
            assert!(matches!(
                cipher.decrypt(&file, 0, &bad),
                Err(ShareError::ChunkIntegrityFailure { index: 0, .. })
            ));
        }

        let mut short = sealed.clone();
        short.iv.pop();
        assert!(cipher.decrypt(&file, 0, &short).is_err());
    }

    #[test]
    fn test_chunk_bound_to_position() {
        let cipher = cipher();
        let file = FileId::new("f");
        let sealed = cipher.encrypt(&file, 1, b"one").unwrap();
        assert!(cipher.decrypt(&file, 2, &sealed).is_err());
        assert!(cipher.decrypt(&FileId::new("g"), 1, &sealed).is_err());
    }

    #[test]
    fn test_derived_keys_differ_per_session_and_secret() {
        let session = Uuid::new_v4();
        let file = FileId::new("f");
        let a = ChunkCipher::derive("secret", &session).unwrap();
        let b = ChunkCipher::derive("secret", &session).unwrap();
        let c = ChunkCipher::derive("other", &session).unwrap();
        let d = ChunkCipher::derive("secret", &Uuid::new_v4()).unwrap();

        let sealed = a.encrypt(&file, 0, b"x").unwrap();
        assert_eq!(b.decrypt(&file, 0, &sealed).unwrap(), b"x");
        assert!(c.decrypt(&file, 0, &sealed).is_err());
        assert!(d.decrypt(&file, 0, &sealed).is_err());
    }

    #[test]
    fn test_seal_records_plaintext_hash() {
        let cipher = cipher();
        let record = cipher.seal(&FileId::new("f"), 2, b"abc").unwrap();
        assert_eq!(record.index, 2);
        assert_eq!(record.content_hash, HashUtils::hash_data(b"abc"));
    }
}
