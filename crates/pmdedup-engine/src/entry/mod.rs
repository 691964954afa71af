//! Metadata entry store
//!
//! One entry per occupied physical block slot:
//! - **Entries** live in a fixed-size table partitioned across a pool of
//!   striped locks (`entry_id mod pool_size`)
//! - **Free list** hands out unused entry ids
//! - **Reverse map** (`blocknr -> entry id`) guards against acting on an
//!   entry whose slot was reclaimed and reused
//! - **Table file** (optional) persists every mutation as a 64-byte record
//!
//! Census invariant (quiescent): `free + live + pending == capacity`.

mod free_list;
mod store;
mod table;

pub use free_list::FreeList;
pub use store::{EntryGuard, EntryStore};
pub use table::EntryTable;

use pmdedup_common::{BlockNumber, StrongFingerprint, WeakFingerprint};
use serde::Serialize;

/// Fingerprinting state of an entry
///
/// Monotonically increases `Unfinalized -> WeakValid -> StrongValid`
/// except on reclamation, which resets it to `Free`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum EntryState {
    /// Slot unused (on the free list or about to be)
    #[default]
    Free,
    /// Written without fingerprints; waiting for the finalizer
    Unfinalized,
    /// Weak fingerprint valid, strong fingerprint not computed
    WeakValid,
    /// Both fingerprints valid
    StrongValid,
}

impl EntryState {
    /// Whether the weak fingerprint field is meaningful
    #[must_use]
    pub const fn has_weak(self) -> bool {
        matches!(self, Self::WeakValid | Self::StrongValid)
    }

    /// Whether the strong fingerprint field is meaningful
    #[must_use]
    pub const fn has_strong(self) -> bool {
        matches!(self, Self::StrongValid)
    }
}

/// Metadata describing one stored unique content
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    /// Transaction tag of the last persisted mutation
    pub txid: u64,
    /// Logical references to this content
    pub refcount: u64,
    /// Physical block holding the content
    pub blocknr: BlockNumber,
    /// Strong fingerprint (valid when `state.has_strong()`)
    pub fp_strong: StrongFingerprint,
    /// Weak fingerprint (valid when `state.has_weak()`)
    pub fp_weak: WeakFingerprint,
    /// Fingerprinting state
    pub state: EntryState,
}

impl Entry {
    /// Entry for freshly written content, holding one reference
    #[must_use]
    pub fn new(
        blocknr: BlockNumber,
        fp_weak: WeakFingerprint,
        fp_strong: StrongFingerprint,
        state: EntryState,
    ) -> Self {
        Self {
            txid: 0,
            refcount: 1,
            blocknr,
            fp_strong,
            fp_weak,
            state,
        }
    }

    /// Slot is in use and not waiting for reclamation
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !matches!(self.state, EntryState::Free) && self.refcount > 0
    }

    /// Slot is in use but its last reference was released
    #[must_use]
    pub const fn is_pending_reclaim(&self) -> bool {
        !matches!(self.state, EntryState::Free) && self.refcount == 0
    }

    /// Reset to the free state, keeping the transaction tag
    pub fn clear(&mut self) {
        *self = Self {
            txid: self.txid,
            ..Self::default()
        };
    }
}

/// Entry table occupancy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EntryCensus {
    /// Entries in the free state
    pub free: u64,
    /// Entries with at least one reference
    pub live: u64,
    /// Entries whose references dropped to zero, not yet reclaimed
    pub pending: u64,
    /// Sum of all reference counts
    pub references: u64,
}

impl EntryCensus {
    /// Total entries accounted for
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.free + self.live + self.pending
    }
}
