//! BLAKE3 fingerprints for graph and result-cache identity.
//!
//! A fingerprint is stable across processes for the same logical input:
//! JSON values are hashed in their canonical (key-sorted) encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A BLAKE3 digest (256 bits / 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// The number of bytes in a fingerprint
    pub const LEN: usize = 32;

    /// Compute the fingerprint of raw bytes
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    ///
    /// Returns error if hex is invalid or not 32 bytes
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(hex).map_err(|_| HashError::InvalidHex)?;
        if bytes.len() != Self::LEN {
            return Err(HashError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Combine with another fingerprint: hash(self || other)
    #[must_use]
    pub fn chain(&self, other: &Fingerprint) -> Self {
        let mut combined = [0u8; 64];
        combined[0..32].copy_from_slice(&self.0);
        combined[32..64].copy_from_slice(&other.0);
        Self::compute(&combined)
    }

    /// Short prefix used in log fields
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Fingerprint parse errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Invalid hex encoding
    InvalidHex,
    /// Invalid length (not 32 bytes)
    InvalidLength(usize),
}

impl std::error::Error for HashError {}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHex => write!(f, "Invalid hex encoding"),
            Self::InvalidLength(len) => write!(f, "Invalid fingerprint length: {} (expected 32)", len),
        }
    }
}

/// Incremental fingerprint builder.
///
/// Every field is length-prefixed so that `("ab", "c")` and `("a", "bc")`
/// never collide.
pub struct Fingerprinter {
    hasher: blake3::Hasher,
}

impl Fingerprinter {
    /// Start a fingerprint under a domain label
    #[must_use]
    pub fn new(domain: &str) -> Self {
        let mut this = Self {
            hasher: blake3::Hasher::new(),
        };
        this.update_str(domain);
        this
    }

    /// Feed raw bytes
    pub fn update_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(&(bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Feed a string
    pub fn update_str(&mut self, s: &str) -> &mut Self {
        self.update_bytes(s.as_bytes())
    }

    /// Feed a JSON value in canonical form
    pub fn update_json(&mut self, value: &serde_json::Value) -> &mut Self {
        // serde_json maps are key-sorted without `preserve_order`
        let encoded = serde_json::to_vec(value).unwrap_or_default();
        self.update_bytes(&encoded)
    }

    /// Feed another fingerprint
    pub fn update_fingerprint(&mut self, fp: &Fingerprint) -> &mut Self {
        self.update_bytes(fp.as_bytes())
    }

    /// Finish
    #[must_use]
    pub fn finish(&self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }
}
