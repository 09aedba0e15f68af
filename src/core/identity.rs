//! Peer identity and source authentication.
//!
//! A source owns an Ed25519 key pair and signs every envelope it sends; a
//! consumer sends unsigned envelopes. Any envelope claiming the source role
//! must pass [`verify`] before the node acts on it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::trace;
use rand::RngCore;
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::core::protocol::{now_millis, Body, Envelope, PeerId, Role};
use crate::storage::ChunkCipher;
use crate::utils::{Result, ShareError};

/// Ed25519 signing key. Never printed.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let signing = SigningKey::from_bytes(&secret);
        secret.fill(0);
        Self { signing }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    fn sign(&self, data: &[u8]) -> String {
        let signature: Signature = self.signing.sign(data);
        hex::encode(signature.to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

#[derive(Debug)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub role: Role,
    pub name: String,
    pub address: SocketAddr,
    /// Set for sources only; names the distribution session.
    pub session_id: Option<Uuid>,
    keypair: Option<KeyPair>,
}

impl PeerIdentity {
    /// Fresh identity for this process. Sources also get a key pair and a
    /// session id.
    pub fn create(role: Role, name: impl Into<String>, address: SocketAddr) -> Self {
        let (keypair, session_id) = match role {
            Role::Source => (Some(KeyPair::generate()), Some(Uuid::new_v4())),
            Role::Consumer => (None, None),
        };

        Self {
            id: PeerId::random(),
            role,
            name: name.into(),
            address,
            session_id,
            keypair,
        }
    }

    pub fn public_key_hex(&self) -> Option<String> {
        self.keypair.as_ref().map(KeyPair::public_key_hex)
    }

    /// Wrap `body` in an envelope, signed when this identity is a source.
    pub fn sign(&self, body: Body) -> Result<Envelope> {
        let mut envelope = Envelope {
            peer_id: self.id,
            role: self.role,
            session_id: self.session_id,
            timestamp: now_millis(),
            public_key: self.public_key_hex(),
            signature: None,
            body,
        };

        if let Some(keypair) = &self.keypair {
            let bytes = envelope.signing_bytes()?;
            envelope.signature = Some(keypair.sign(&bytes));
        }

        Ok(envelope)
    }
}

/// Check the embedded signature against the embedded public key.
///
/// Fails closed: a missing field, malformed hex, a bad key or a signature
/// mismatch all return `false`.
pub fn verify(envelope: &Envelope) -> bool {
    let (Some(public_key), Some(signature)) = (&envelope.public_key, &envelope.signature) else {
        return false;
    };

    let Ok(key_bytes) = hex::decode(public_key) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        trace!("verify: invalid public key bytes");
        return false;
    };

    let Ok(sig_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);

    match envelope.signing_bytes() {
        Ok(bytes) => verifying_key.verify(&bytes, &signature).is_ok(),
        Err(_) => false,
    }
}

/// The authentication gate: source envelopes must verify, consumer
/// envelopes pass through.
pub fn authenticate(envelope: &Envelope) -> Result<()> {
    if envelope.role == Role::Source && !verify(envelope) {
        return Err(ShareError::AuthenticationFailure(format!(
            "bad or missing signature from {} ({})",
            envelope.peer_id.short(),
            envelope.body.kind()
        )));
    }
    Ok(())
}

/// The source a consumer has accepted for the rest of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    pub peer_id: PeerId,
    pub public_key: String,
    pub session_id: Uuid,
}

impl TrustAnchor {
    /// Build an anchor from an already verified source envelope.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        if envelope.role != Role::Source {
            return None;
        }
        Some(Self {
            peer_id: envelope.peer_id,
            public_key: envelope.public_key.clone()?,
            session_id: envelope.session_id?,
        })
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        envelope.peer_id == self.peer_id
            && envelope.public_key.as_deref() == Some(self.public_key.as_str())
            && envelope.session_id == Some(self.session_id)
    }
}

/// Session trust held by a node: the pinned source (consumers only) and the
/// chunk key of the session.
#[derive(Default)]
pub struct TrustState {
    anchor: Option<TrustAnchor>,
    cipher: Option<ChunkCipher>,
}

impl TrustState {
    /// A source trusts itself and knows its key from the start.
    pub fn for_source(identity: &PeerIdentity, secret: &str) -> Result<Self> {
        let session_id = identity.session_id.ok_or_else(|| {
            ShareError::CryptoError("source identity has no session id".into())
        })?;
        Ok(Self {
            anchor: None,
            cipher: Some(ChunkCipher::derive(secret, &session_id)?),
        })
    }

    pub fn anchor(&self) -> Option<&TrustAnchor> {
        self.anchor.as_ref()
    }

    pub fn cipher(&self) -> Option<&ChunkCipher> {
        self.cipher.as_ref()
    }

    /// Accept `anchor` as the session source and derive the chunk key from
    /// its session id. The first anchor is kept for the process lifetime.
    pub fn pin(&mut self, anchor: TrustAnchor, secret: &str) -> Result<bool> {
        if self.anchor.is_some() {
            return Ok(false);
        }
        self.cipher = Some(ChunkCipher::derive(secret, &anchor.session_id)?);
        self.anchor = Some(anchor);
        Ok(true)
    }
}
