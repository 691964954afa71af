//! Core type definitions for pmdedup
//!
//! This module defines the identifiers shared by the entry store, the
//! fingerprint index and the block devices, plus the deduplication modes.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one deduplicated block (4KB)
pub const BLOCK_SIZE: usize = 4096;

/// Content of exactly one block
pub type Block = [u8; BLOCK_SIZE];

/// Physical block number on the backing device
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
    Display,
)]
#[display("{_0}")]
pub struct BlockNumber(u64);

impl BlockNumber {
    /// Create from a raw block number
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw block number
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockNumber({})", self.0)
    }
}

/// Position of a metadata entry in the entry table
///
/// Stable for the lifetime of the entry; reused after reclamation.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into,
    Display,
)]
#[display("{_0}")]
pub struct EntryId(u64);

impl EntryId {
    /// Create from a raw table index
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw table index
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Get the table index as usize
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

/// Fingerprinting strategy applied to submitted blocks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// Strong digest of every block, strong index is authoritative
    #[display("strong-first")]
    StrongFirst,
    /// Weak digest pre-filter, strong digest only on a weak hit
    #[default]
    #[display("weak-then-strong")]
    WeakThenStrong,
    /// No digest on the write path; the finalizer fingerprints later
    #[display("no-fingerprint")]
    NoFingerprint,
}

impl DedupMode {
    /// Stable numeric tag (for atomic storage)
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::StrongFirst => 0,
            Self::WeakThenStrong => 1,
            Self::NoFingerprint => 2,
        }
    }

    /// Decode a tag produced by [`DedupMode::as_u8`]
    #[must_use]
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::StrongFirst),
            1 => Some(Self::WeakThenStrong),
            2 => Some(Self::NoFingerprint),
            _ => None,
        }
    }
}

/// Result of submitting one block for write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOutcome {
    /// True when the content already existed and no block was written
    pub duplicate: bool,
    /// Block now holding the content
    pub blocknr: BlockNumber,
}

impl WriteOutcome {
    /// Outcome for content that was written to a fresh block
    #[must_use]
    pub const fn new_block(blocknr: BlockNumber) -> Self {
        Self {
            duplicate: false,
            blocknr,
        }
    }

    /// Outcome for content redirected to an existing block
    #[must_use]
    pub const fn duplicate_of(blocknr: BlockNumber) -> Self {
        Self {
            duplicate: true,
            blocknr,
        }
    }
}
