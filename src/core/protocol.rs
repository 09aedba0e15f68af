use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::utils::{Result, ShareError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Source,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

/// 128 random bits, rendered as hex on the wire and in logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ShareError::SerializationError(format!("Invalid peer id: {}", e)))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| ShareError::SerializationError("Peer id must be 16 bytes".into()))?;
        Ok(Self(bytes))
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
    /// SHA-256 of the whole file, checked after assembly.
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub file_id: FileId,
    pub chunk_index: u32,
    #[serde(with = "hex::serde")]
    pub iv: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Periodic presence; from a source this is also the session start.
    Discovery { name: String },
    /// Asks sources to announce themselves right away.
    Probe,
    Advertise(Advertisement),
    ChunkAvailable { file_id: FileId, chunks: Vec<u32> },
    ChunkRequest { file_id: FileId, chunk_index: u32 },
    ChunkResponse(ChunkPayload),
}

impl Body {
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Discovery { .. } => "discovery",
            Body::Probe => "probe",
            Body::Advertise(_) => "advertise",
            Body::ChunkAvailable { .. } => "chunk_available",
            Body::ChunkRequest { .. } => "chunk_request",
            Body::ChunkResponse(_) => "chunk_response",
        }
    }
}

/// Every datagram on the wire is one envelope.
///
/// Sources fill `public_key` and `signature`; the signature covers every
/// other field (see [`Envelope::signing_bytes`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub peer_id: PeerId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub body: Body,
}

#[derive(Serialize)]
struct SigningView<'a> {
    peer_id: &'a PeerId,
    role: Role,
    session_id: &'a Option<Uuid>,
    timestamp: i64,
    public_key: &'a Option<String>,
    body: &'a Body,
}

impl Envelope {
    /// Canonical bytes covered by the signature: all fields but `signature`.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let view = SigningView {
            peer_id: &self.peer_id,
            role: self.role,
            session_id: &self.session_id,
            timestamp: self.timestamp,
            public_key: &self.public_key,
            body: &self.body,
        };
        Ok(serde_json::to_vec(&view)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: Body) -> Envelope {
        Envelope {
            peer_id: PeerId::random(),
            role: Role::Consumer,
            session_id: None,
            timestamp: 1_700_000_000_000,
            public_key: None,
            signature: None,
            body,
        }
    }

    #[test]
    fn test_peer_id_hex_round_trip() {
        let id = PeerId::random();
        let parsed = PeerId::from_hex(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(PeerId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_body_is_tagged_json() {
        let env = envelope(Body::ChunkRequest {
            file_id: FileId::new("f1"),
            chunk_index: 7,
        });
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["body"]["type"], "chunk_request");
        assert_eq!(json["body"]["chunk_index"], 7);
        assert_eq!(json["role"], "consumer");
        assert!(json.get("signature").is_none());
    }

    #[test]
    fn test_chunk_payload_bytes_are_hex() {
        let env = envelope(Body::ChunkResponse(ChunkPayload {
            file_id: FileId::new("f1"),
            chunk_index: 0,
            iv: vec![0xab; 12],
            ciphertext: vec![1, 2, 3],
        }));
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["body"]["ciphertext"], "010203");

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_signing_bytes_ignore_signature() {
        let mut env = envelope(Body::Probe);
        let before = env.signing_bytes().unwrap();
        env.signature = Some("00".repeat(64));
        assert_eq!(before, env.signing_bytes().unwrap());

        env.timestamp += 1;
        assert_ne!(before, env.signing_bytes().unwrap());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"peer_id":"zz","role":"source"}"#).is_err());
    }
}
