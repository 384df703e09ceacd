//! Peer identity: X25519 keypair and the peer ID derived from it.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Peer public key (32 bytes, X25519). Sent in the connection hello.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Peer ID: SHA-256 of the public key. Rendered as lowercase hex in addresses.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_32")] [u8; 32]);

impl PeerId {
    pub fn from_public_key(public: &PublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public.as_bytes());
        PeerId(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerIdError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let len = bytes.len();
        let id: [u8; 32] = bytes.try_into().map_err(|_| PeerIdError::Length(len))?;
        Ok(PeerId(id))
    }
}

/// Keypair plus derived peer ID. Immutable once built; the secret never leaves it.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a new random keypair and derive the peer ID from its public key.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild an identity from externally supplied secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(&public);
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[cfg(test)]
    fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
