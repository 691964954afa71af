//! Content fingerprints for deduplication
//!
//! Two digests are kept per block:
//! - a 32-bit weak fingerprint (CRC32C), cheap and collision-prone, used
//!   as a pre-filter
//! - a 256-bit strong fingerprint (SHA-256), the authoritative equality test
//!
//! Digest computation sits behind the [`Digester`] trait so the engine can
//! be driven by alternative hash functions.

use crate::types::Block;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 32-bit weak fingerprint of a block
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeakFingerprint(pub u32);

impl WeakFingerprint {
    /// Size of the fingerprint on disk
    pub const SIZE: usize = 4;

    /// Bucket index: the low `bits` bits of the value
    #[must_use]
    pub const fn bucket(&self, bits: u32) -> usize {
        (self.0 as u64 & low_mask(bits)) as usize
    }
}

impl fmt::Debug for WeakFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakFingerprint({:08x})", self.0)
    }
}

/// 256-bit strong fingerprint of a block, as four 64-bit words
///
/// Equality is word-by-word equality of all four words.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrongFingerprint(pub [u64; 4]);

impl StrongFingerprint {
    /// Size of the fingerprint on disk
    pub const SIZE: usize = 32;

    /// Build from a raw 32-byte digest (little-endian words)
    #[must_use]
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(digest.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        Self(words)
    }

    /// Bucket index: the low `bits` bits of the first word
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn bucket(&self, bits: u32) -> usize {
        (self.0[0] & low_mask(bits)) as usize
    }

    /// Hex rendering of the digest bytes
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Debug for StrongFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrongFingerprint({})", self.to_hex())
    }
}

#[inline]
const fn low_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Digest primitives consumed by the engine
///
/// Implementations must be pure and deterministic over exactly one block.
pub trait Digester: Send + Sync {
    /// Cheap digest used as a pre-filter
    fn weak(&self, block: &Block) -> WeakFingerprint;

    /// Collision-resistant digest used as the equality test
    fn strong(&self, block: &Block) -> StrongFingerprint;
}

/// CRC32C weak digest and SHA-256 strong digest
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDigester;

impl Digester for DefaultDigester {
    fn weak(&self, block: &Block) -> WeakFingerprint {
        WeakFingerprint(crc32c::crc32c(block))
    }

    fn strong(&self, block: &Block) -> StrongFingerprint {
        let digest: [u8; 32] = Sha256::digest(block).into();
        StrongFingerprint::from_digest(&digest)
    }
}
