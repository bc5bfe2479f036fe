//! Header-protection provider: key derivation, AEAD seal/open, Pearson hash.
//!
//! The overlay encrypts packet *headers* only; payload confidentiality is
//! end-to-end between edges and never touches the supernode. Three modes:
//!
//! - `None` — header in the clear.
//! - `Static` — header sealed with a community-wide key derived from the
//!   community's shared secret (default: the community name itself).
//! - `User` — header sealed with a key derived from the X25519 shared
//!   secret between the supernode's keypair and one registered user key;
//!   whichever user key opens the header establishes the sender identity.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Symmetric header key (ChaCha20-Poly1305).
pub const HEADER_KEY_SIZE: usize = 32;
pub type HeaderKey = [u8; HEADER_KEY_SIZE];

/// AEAD nonce length prepended to every sealed header.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag appended by seal.
pub const SEAL_OVERHEAD: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("header authentication failed")]
    AuthFailed,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// How a community protects its packet headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMode {
    None,
    Static,
    User,
}

impl fmt::Display for HeaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderMode::None => write!(f, "none"),
            HeaderMode::Static => write!(f, "static"),
            HeaderMode::User => write!(f, "user"),
        }
    }
}

impl FromStr for HeaderMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(HeaderMode::None),
            "static" => Ok(HeaderMode::Static),
            "user" => Ok(HeaderMode::User),
            other => Err(CryptoError::InvalidKey(format!("unknown header mode '{other}'"))),
        }
    }
}

/// Key material the codec tries when opening an encrypted header.
///
/// Implemented by the community registry; the codec itself stays pure and
/// stateless.
pub trait KeyStore {
    /// (community name, key) pairs for static-mode headers, in a stable order.
    fn static_keys(&self) -> Vec<(String, HeaderKey)>;
    /// (community, username, key) triples for user-mode headers.
    fn user_keys(&self) -> Vec<(String, String, HeaderKey)>;
}

/// Supernode X25519 identity used to derive user-mode header keys.
pub struct SnKeypair {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl SnKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Header key shared with one user: SHA3-256 of the X25519 agreement.
    pub fn shared_key(&self, user_public: &[u8; 32]) -> HeaderKey {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*user_public));
        let digest = Sha3_256::digest(shared.as_bytes());
        digest.into()
    }

    /// Load the supernode key from a hex file, generating and persisting a
    /// fresh one on first start.
    pub fn load_or_generate(path: &Path) -> io::Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let bytes = hex::decode(text.trim()).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad key file: {e}"))
            })?;
            let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "key file must hold 32 hex bytes")
            })?;
            Ok(Self::from_secret_bytes(bytes))
        } else {
            let keypair = Self::generate();
            std::fs::write(path, hex::encode(keypair.secret.to_bytes()))?;
            Ok(keypair)
        }
    }
}

/// Community-wide static header key: SHA3-256 of the shared secret.
pub fn derive_static_key(secret: &str) -> HeaderKey {
    Sha3_256::digest(secret.as_bytes()).into()
}

/// Deterministic user secret for `vesper-keygen`: SHA3-256 of
/// `username:password`. The matching public key goes into the community's
/// ACL key file.
pub fn derive_user_secret(username: &str, password: &str) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

pub fn user_public_key(secret: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

/// Seal a header under `key`. Output is ciphertext plus the Poly1305 tag.
pub fn seal_header(key: &HeaderKey, nonce: &[u8; NONCE_SIZE], header: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    // Encryption of an in-memory buffer with a fresh nonce cannot fail.
    cipher
        .encrypt(Nonce::from_slice(nonce), header)
        .unwrap_or_default()
}

pub fn open_header(
    key: &HeaderKey,
    nonce: &[u8; NONCE_SIZE],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::AuthFailed)
}

// =============================================================================
// PEARSON HASH
// =============================================================================
// Drives the deterministic auto-IP allocator: 64-bit output, pure function
// of its input, identical across restarts and across supernodes.

/// 256-entry permutation table (affine map with an odd multiplier, so every
/// byte value appears exactly once).
const PEARSON_TABLE: [u8; 256] = build_pearson_table();

const fn build_pearson_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        table[i] = ((i as u8).wrapping_mul(167)).wrapping_add(13);
        i += 1;
    }
    table
}

/// 64-bit Pearson hash: eight lanes of the classic byte-chained table walk,
/// each lane seeded with a different offset of the first byte.
pub fn pearson_64(data: &[u8]) -> u64 {
    let mut out = 0u64;
    let first = data.first().copied().unwrap_or(0);
    for lane in 0u8..8 {
        let mut h = PEARSON_TABLE[first.wrapping_add(lane) as usize];
        for &b in data.iter().skip(1) {
            h = PEARSON_TABLE[(h ^ b) as usize];
        }
        out = (out << 8) | h as u64;
    }
    out
}
