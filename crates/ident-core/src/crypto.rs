//! Identity primitives for ident.
//!
//! Provides three things:
//!   1. BLAKE3 hashing — peer identities are derived from public keys
//!   2. Long-term X25519 keypairs, persisted as a hex private key
//!   3. The public-key wire encoding and the `PeerId` derived from it
//!
//! A peer's identity is BLAKE3(encoded public key). Anyone holding a
//! claimed key can therefore check it against the identity a connection
//! was established with.
//!
//! All private key material derives ZeroizeOnDrop.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Peer identity ─────────────────────────────────────────────────────────────

/// Stable identity of a node: BLAKE3 of its encoded public key.
///
/// The all-zero id is the *empty* identity: what an unauthenticated
/// transport reports when it has no idea who is on the other end.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// The empty identity.
    pub const EMPTY: PeerId = PeerId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// First 8 bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
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

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::BadPeerId)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadPeerId)?;
        Ok(Self(bytes))
    }
}

// ── Public keys ───────────────────────────────────────────────────────────────

/// Key-type tag for X25519 keys in the wire encoding.
pub const KEY_TYPE_X25519: u8 = 0x01;

/// Encoded length: one type byte plus 32 key bytes.
pub const ENCODED_KEY_LEN: usize = 33;

/// A peer's long-term public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_raw(&self) -> &[u8; 32] {
        &self.0
    }

    /// Wire encoding: `[KEY_TYPE_X25519] ++ key`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENCODED_KEY_LEN);
        out.push(KEY_TYPE_X25519);
        out.extend_from_slice(&self.0);
        out
    }

    /// Parse the wire encoding produced by [`PublicKey::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let (key_type, rest) = data.split_first().ok_or(CryptoError::EmptyKey)?;
        if *key_type != KEY_TYPE_X25519 {
            return Err(CryptoError::UnknownKeyType(*key_type));
        }
        let raw: [u8; 32] = rest
            .try_into()
            .map_err(|_| CryptoError::KeyLength(rest.len()))?;
        if raw == [0u8; 32] {
            return Err(CryptoError::DegenerateKey);
        }
        Ok(Self(raw))
    }

    /// The identity this key speaks for.
    pub fn peer_id(&self) -> PeerId {
        PeerId(hash(&self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(&self.0[..8]))
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A node's long-term static X25519 keypair.
///
/// Generated once per node and stored persistently. The public key is
/// announced in every identify payload. The private key never leaves this
/// struct.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key. Zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    #[zeroize(skip)]
    pub public: PublicKey,
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        Self::from_private(secret.to_bytes())
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = DalekPublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: PublicKey(*public.as_bytes()),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn peer_id(&self) -> PeerId {
        self.public.peer_id()
    }

    /// Load the keypair stored at `path`, generating and writing a new one
    /// if the file does not exist. The file holds the hex private key.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let bytes = Zeroizing::new(
                    hex::decode(text.trim()).map_err(|_| CryptoError::BadKeyFile)?,
                );
                let private: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::BadKeyFile)?;
                Ok(Self::from_private(private))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let encoded = Zeroizing::new(hex::encode(*keypair.private));
                std::fs::write(path, encoded.as_bytes())?;
                Ok(keypair)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("empty public key")]
    EmptyKey,

    #[error("unknown key type 0x{0:02x}")]
    UnknownKeyType(u8),

    #[error("public key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("all-zero public key")]
    DegenerateKey,

    #[error("peer id must be 64 hex characters")]
    BadPeerId,

    #[error("key file does not hold a hex-encoded 32-byte private key")]
    BadKeyFile,

    #[error("key file I/O: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
