use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Structural digest of a [`Value`](crate::Value) or machine.
///
/// A `Hash` is a BLAKE3 digest computed over a value's shape rather than its
/// memory layout. Identical structure always produces the same `Hash`, which
/// makes it the deduplication key of the value store.
#[derive(Clone, Copy, PartialEq, Eq, std::hash::Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Byte width of a hash.
    pub const LEN: usize = 32;

    /// Create a `Hash` from a pre-computed digest.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 32-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Domain-separated BLAKE3 hasher for one value shape.
///
/// Each hasher carries a type tag that is fed to BLAKE3 ahead of the shape's
/// contents, so an integer and a tuple can never collide even if their
/// encoded bytes happen to agree.
pub struct StructuralHasher {
    domain: &'static str,
}

impl StructuralHasher {
    /// Hasher for integer scalars.
    pub const INT: Self = Self {
        domain: "vmcp-int-v1",
    };
    /// Hasher for tuples (including the empty tuple).
    pub const TUPLE: Self = Self {
        domain: "vmcp-tuple-v1",
    };
    /// Hasher for machine images.
    pub const MACHINE: Self = Self {
        domain: "vmcp-machine-v1",
    };

    /// Hash an integer scalar from its bits.
    pub fn hash_int(&self, v: i64) -> Hash {
        let mut hasher = self.start();
        hasher.update(&v.to_be_bytes());
        Hash::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Hash an ordered sequence of child hashes, prefixed by their count.
    pub fn hash_children(&self, children: &[Hash]) -> Hash {
        let mut hasher = self.start();
        hasher.update(&(children.len() as u64).to_be_bytes());
        for child in children {
            hasher.update(child.as_bytes());
        }
        Hash::from_bytes(*hasher.finalize().as_bytes())
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> Hash {
        let mut hasher = self.start();
        hasher.update(data);
        Hash::from_bytes(*hasher.finalize().as_bytes())
    }

    fn start(&self) -> blake3::Hasher {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher
    }
}
