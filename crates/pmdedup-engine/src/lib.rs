//! pmdedup Engine - Adaptive block deduplication
//!
//! This crate implements the deduplication engine of a block store:
//! - Persistent metadata entry table (64-byte records) with a free-list allocator
//! - Two-level fingerprint index (weak pre-filter + strong equality)
//! - Adaptive mode controller choosing how much fingerprinting to pay for
//! - Decision engine redirecting duplicate writes to existing blocks
//! - Background finalizer lazily fingerprinting deferred blocks
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DedupEngine                         │
//! │   submit_block ──► ModeController ──► strategy          │
//! │                                         │               │
//! │  ┌──────────────────┐    ┌──────────────▼────────────┐  │
//! │  │ FingerprintIndex │◄───┤ EntryStore (striped locks)│  │
//! │  │  weak │ strong   │    │  free list │ reverse map  │  │
//! │  └────────▲─────────┘    └──────────────▲────────────┘  │
//! │           │          Finalizer          │               │
//! │           └──────── (background) ───────┘               │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │
//!                      BlockDevice (write / read / release)
//! ```
//!
//! # Lock ordering
//! Entry stripe locks may be held while taking index bucket locks; index
//! bucket locks never wait on entry locks. At most one entry stripe is
//! held at a time.

pub mod block;
pub mod device;
pub mod engine;
pub mod entry;
pub mod finalizer;
pub mod index;
pub mod layout;
pub mod mode;
pub mod raw_io;
pub mod stats;

// Re-exports
pub use block::BlockBitmap;
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use engine::DedupEngine;
pub use entry::{Entry, EntryCensus, EntryGuard, EntryState, EntryStore, EntryTable, FreeList};
pub use finalizer::{Finalizer, FinalizerSignal, PassReport};
pub use index::{FingerprintIndex, HashTable, IndexKey};
pub use layout::{ENTRY_SIZE, ENTRY_TABLE_OFFSET, TableHeader};
pub use mode::{ModeController, ModeState, ModeTransition};
pub use raw_io::RawFile;
pub use stats::{DedupStats, DedupStatsSnapshot};
