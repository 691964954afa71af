//! Deduplication decision engine
//!
//! `submit_block` dispatches on the active [`DedupMode`]:
//!
//! - **StrongFirst**: strong digest of every block; the strong table
//!   decides.
//! - **WeakThenStrong**: weak digest first. A weak hit upgrades the
//!   matched entry to strong (reading its stored block if needed) and
//!   compares strong digests. A weak miss stores the block weak-indexed.
//! - **NoFingerprint**: store the block unfingerprinted and leave it to
//!   the finalizer.
//!
//! New entries are published to the strong table with insert-if-absent.
//! A submitter that loses the race for identical content folds its
//! reference into the winner and releases its own block.
//!
//! Every index hit is re-checked under the entry lock (live, same
//! fingerprint) before it is acted on; a hit that fails the check is a
//! miss.

use crate::device::BlockDevice;
use crate::entry::{Entry, EntryCensus, EntryState, EntryStore};
use crate::finalizer::{self, Finalizer, FinalizerSignal, PassReport};
use crate::index::FingerprintIndex;
use crate::mode::{ModeController, ModeState};
use crate::stats::{DedupStats, DedupStatsSnapshot};
use parking_lot::Mutex;
use pmdedup_common::{
    Block, BlockNumber, DedupConfig, DedupMode, DefaultDigester, Digester, EntryId, Error, Result,
    StrongFingerprint, WeakFingerprint, WriteOutcome,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared between foreground callers and the finalizer thread
pub(crate) struct Shared {
    pub(crate) config: DedupConfig,
    pub(crate) entries: EntryStore,
    pub(crate) index: FingerprintIndex,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) digester: Arc<dyn Digester>,
    pub(crate) mode: ModeController,
    pub(crate) stats: DedupStats,
    pub(crate) signal: FinalizerSignal,
}

/// Adaptive block deduplication engine
pub struct DedupEngine {
    shared: Arc<Shared>,
    finalizer: Mutex<Option<Finalizer>>,
}

impl DedupEngine {
    /// Volatile engine over `device` with the default digests
    pub fn new(config: DedupConfig, device: Arc<dyn BlockDevice>) -> Result<Self> {
        let capacity = config.entries_for(device.capacity());
        let entries = EntryStore::in_memory(capacity, config.lock_pool_size)?;
        Self::with_store(config, device, Arc::new(DefaultDigester), entries)
    }

    /// Engine persisting its entries to a new table file
    pub fn create(
        config: DedupConfig,
        device: Arc<dyn BlockDevice>,
        table_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let capacity = config.entries_for(device.capacity());
        let entries = EntryStore::create(table_path, capacity, config.lock_pool_size)?;
        Self::with_store(config, device, Arc::new(DefaultDigester), entries)
    }

    /// Engine recovered from an existing table file
    ///
    /// Every block referenced by the table is claimed on `device` and the
    /// fingerprint index is rebuilt from the records.
    pub fn open(
        config: DedupConfig,
        device: Arc<dyn BlockDevice>,
        table_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let entries = EntryStore::open(table_path, config.lock_pool_size)?;
        Self::with_store(config, device, Arc::new(DefaultDigester), entries)
    }

    /// Engine over an explicit entry store and digester
    pub fn with_store(
        config: DedupConfig,
        device: Arc<dyn BlockDevice>,
        digester: Arc<dyn Digester>,
        entries: EntryStore,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            index: FingerprintIndex::new(config.index_bucket_bits, config.lock_pool_size),
            mode: ModeController::new(config.mode.clone()),
            stats: DedupStats::default(),
            signal: FinalizerSignal::default(),
            config,
            entries,
            device,
            digester,
        });

        let deferred = Self::recover(&shared)?;

        let engine = Self {
            shared,
            finalizer: Mutex::new(None),
        };
        info!(
            "Dedup engine ready: {} entries ({} free), {} device blocks, mode {}",
            engine.shared.entries.capacity(),
            engine.shared.entries.free_count(),
            engine.shared.device.capacity(),
            engine.mode()
        );

        if engine.shared.config.finalizer.enabled {
            engine.start_finalizer()?;
        }
        if deferred > 0 {
            engine.notify_finalizer();
        }
        Ok(engine)
    }

    /// Claim blocks and rebuild the index from occupied entries
    ///
    /// Returns the number of entries left for the finalizer.
    fn recover(shared: &Shared) -> Result<u64> {
        let occupied = shared.entries.occupied();
        if occupied.is_empty() {
            return Ok(0);
        }

        let mut deferred = 0;
        for (id, entry) in &occupied {
            shared.device.claim_block(entry.blocknr)?;

            if entry.refcount == 0 || entry.state == EntryState::Unfinalized {
                deferred += 1;
            }
            match entry.state {
                EntryState::WeakValid => shared.index.weak.insert(entry.fp_weak, *id),
                EntryState::StrongValid => {
                    let _ = shared.index.strong.insert_if_absent(entry.fp_strong, *id);
                    let _ = shared.index.weak.insert_if_absent(entry.fp_weak, *id);
                }
                EntryState::Unfinalized | EntryState::Free => {}
            }
        }

        info!(
            "Recovered {} entries ({} weak nodes, {} strong nodes, {} deferred)",
            occupied.len(),
            shared.index.weak.len(),
            shared.index.strong.len(),
            deferred
        );
        Ok(deferred)
    }

    /// Submit one block for write
    ///
    /// Returns the block now holding the content and whether it already
    /// existed. Allocation failures propagate with nothing committed.
    pub fn submit_block(&self, content: &Block) -> Result<WriteOutcome> {
        let outcome = match self.shared.mode.mode() {
            DedupMode::StrongFirst => self.strong_first(content),
            DedupMode::WeakThenStrong => self.weak_then_strong(content),
            DedupMode::NoFingerprint => self.no_fingerprint(content),
        }?;

        let stats = &self.shared.stats;
        DedupStats::incr(&stats.submitted);
        if outcome.duplicate {
            DedupStats::incr(&stats.duplicates);
        } else {
            DedupStats::incr(&stats.new_blocks);
        }

        if let Some(transition) = self.shared.mode.record(outcome.duplicate) {
            DedupStats::incr(&stats.mode_windows);
            if transition.changed() {
                DedupStats::incr(&stats.mode_changes);
                if transition.to == DedupMode::NoFingerprint {
                    self.notify_finalizer();
                }
            }
        }

        Ok(outcome)
    }

    fn strong_first(&self, content: &Block) -> Result<WriteOutcome> {
        let digester = &self.shared.digester;
        let weak = digester.weak(content);
        let strong = digester.strong(content);

        if let Some(blocknr) = self.take_strong_match(&strong, Some(weak))? {
            return Ok(WriteOutcome::duplicate_of(blocknr));
        }
        self.publish_strong(content, weak, strong, true)
    }

    fn weak_then_strong(&self, content: &Block) -> Result<WriteOutcome> {
        let digester = &self.shared.digester;
        let weak = digester.weak(content);

        let target = match self.shared.index.weak.lookup(&weak) {
            Some(id) => self.strengthen(id, &weak)?.map(|target| (id, target)),
            None => None,
        };
        let Some((matched, target)) = target else {
            return self.store_weak(content, weak);
        };

        let strong = digester.strong(content);
        if target == strong {
            if let Some(blocknr) = self.take_reference(matched, &strong, None)? {
                return Ok(WriteOutcome::duplicate_of(blocknr));
            }
        } else {
            DedupStats::incr(&self.shared.stats.weak_collisions);
            debug!("Weak collision on {:?} with entry {matched}", weak);
        }

        if let Some(blocknr) = self.take_strong_match(&strong, None)? {
            return Ok(WriteOutcome::duplicate_of(blocknr));
        }
        self.publish_strong(content, weak, strong, false)
    }

    fn no_fingerprint(&self, content: &Block) -> Result<WriteOutcome> {
        let (_, blocknr) = self.store_new(
            content,
            WeakFingerprint::default(),
            StrongFingerprint::default(),
            EntryState::Unfinalized,
        )?;
        Ok(WriteOutcome::new_block(blocknr))
    }

    /// Weak miss: store the block as weak-valid and weak-index it
    fn store_weak(&self, content: &Block, weak: WeakFingerprint) -> Result<WriteOutcome> {
        let (id, blocknr) =
            self.store_new(content, weak, StrongFingerprint::default(), EntryState::WeakValid)?;
        let _entry = self.shared.entries.lock(id)?;
        self.shared.index.weak.insert(weak, id);
        Ok(WriteOutcome::new_block(blocknr))
    }

    /// Strong fingerprint of a weak-hit entry, computing it if needed
    ///
    /// The entry that moves to strong-valid is the one that strong-indexes
    /// itself. Returns `None` when the hit no longer holds.
    fn strengthen(&self, id: EntryId, weak: &WeakFingerprint) -> Result<Option<StrongFingerprint>> {
        let mut entry = self.shared.entries.lock(id)?;
        if !entry.is_live() || !entry.state.has_weak() || entry.fp_weak != *weak {
            return Ok(None);
        }
        if entry.state.has_strong() {
            return Ok(Some(entry.fp_strong));
        }

        let stored = self.shared.device.read_block(entry.blocknr)?;
        let strong = self.shared.digester.strong(&stored);
        entry.update(|e| {
            e.fp_strong = strong;
            e.state = EntryState::StrongValid;
        })?;

        if self.shared.index.strong.insert_if_absent(strong, id).is_err() {
            debug!("Entry {id} strengthened onto already indexed content");
        }
        DedupStats::incr(&self.shared.stats.lazy_strengthened);
        Ok(Some(strong))
    }

    /// Add a reference to the strong-table match for `strong`, if valid
    fn take_strong_match(
        &self,
        strong: &StrongFingerprint,
        backfill: Option<WeakFingerprint>,
    ) -> Result<Option<BlockNumber>> {
        match self.shared.index.strong.lookup(strong) {
            Some(id) => self.take_reference(id, strong, backfill),
            None => Ok(None),
        }
    }

    /// Add a reference to entry `id` if it is live and holds `strong`
    fn take_reference(
        &self,
        id: EntryId,
        strong: &StrongFingerprint,
        backfill: Option<WeakFingerprint>,
    ) -> Result<Option<BlockNumber>> {
        let mut entry = self.shared.entries.lock(id)?;
        if !entry.is_live() || !entry.state.has_strong() || entry.fp_strong != *strong {
            return Ok(None);
        }

        entry.update(|e| {
            e.refcount += 1;
            if let Some(weak) = backfill {
                e.fp_weak = weak;
            }
        })?;
        Ok(Some(entry.blocknr))
    }

    /// Store a strong-valid block and publish it to the strong table
    ///
    /// If identical content was published concurrently, the reference is
    /// folded into that entry and the freshly written block is released.
    fn publish_strong(
        &self,
        content: &Block,
        weak: WeakFingerprint,
        strong: StrongFingerprint,
        index_weak: bool,
    ) -> Result<WriteOutcome> {
        let (id, blocknr) = self.store_new(content, weak, strong, EntryState::StrongValid)?;
        let index = &self.shared.index;

        loop {
            let published = {
                let _entry = self.shared.entries.lock(id)?;
                let published = index.strong.insert_if_absent(strong, id);
                if published.is_ok() && index_weak {
                    let _ = index.weak.insert_if_absent(weak, id);
                }
                published
            };

            let Err(winner) = published else {
                return Ok(WriteOutcome::new_block(blocknr));
            };

            let backfill = index_weak.then_some(weak);
            if let Some(existing) = self.take_reference(winner, &strong, backfill)? {
                // The caller's reference now lives on the winner either way
                if let Err(e) = self.discard(id) {
                    warn!("Failed to discard folded entry {id}: {e}");
                }
                DedupStats::incr(&self.shared.stats.lost_races_folded);
                debug!("Folded entry {id} into concurrent winner {winner}");
                return Ok(WriteOutcome::duplicate_of(existing));
            }

            // Winner is waiting for reclamation; take its place
            index.strong.remove(&strong, winner);
        }
    }

    /// Write a fresh block and bind a new entry to it
    fn store_new(
        &self,
        content: &Block,
        weak: WeakFingerprint,
        strong: StrongFingerprint,
        state: EntryState,
    ) -> Result<(EntryId, BlockNumber)> {
        let shared = &self.shared;
        let blocknr = shared.device.write_new_block(content)?;

        let id = match shared.entries.allocate() {
            Ok(id) => id,
            Err(e) => {
                self.abandon_block(blocknr);
                return Err(e);
            }
        };

        let committed = shared.entries.lock(id).and_then(|mut entry| {
            entry.update(|e| *e = Entry::new(blocknr, weak, strong, state))?;
            shared.entries.bind_block(blocknr, id);
            Ok(())
        });
        if let Err(e) = committed {
            shared.entries.free(id);
            self.abandon_block(blocknr);
            return Err(e);
        }
        Ok((id, blocknr))
    }

    /// Release a block that no entry was bound to
    fn abandon_block(&self, blocknr: BlockNumber) {
        if let Err(e) = self.shared.device.release_block(blocknr) {
            warn!("Failed to release unbound block {blocknr}: {e}");
        }
    }

    /// Drop a never-published entry and its block
    fn discard(&self, id: EntryId) -> Result<()> {
        let entry = self.shared.entries.lock(id)?;
        finalizer::reclaim(&self.shared, entry)
    }

    /// Drop one reference to the content stored in `blocknr`
    ///
    /// Returns the remaining reference count. At zero the entry waits for
    /// the finalizer to reclaim it.
    pub fn release_reference(&self, blocknr: BlockNumber) -> Result<u64> {
        let id = self
            .shared
            .entries
            .owner_of(blocknr)
            .ok_or(Error::UnknownBlock(blocknr))?;

        let mut entry = self.shared.entries.lock(id)?;
        if entry.state == EntryState::Free || entry.blocknr != blocknr {
            return Err(Error::UnknownBlock(blocknr));
        }
        if entry.refcount == 0 {
            return Err(Error::NotReferenced(blocknr));
        }

        entry.update(|e| e.refcount -= 1)?;
        let remaining = entry.refcount;
        drop(entry);

        if remaining == 0 {
            debug!("Block {blocknr} (entry {id}) unreferenced, pending reclaim");
            self.notify_finalizer();
        }
        Ok(remaining)
    }

    /// Start the background finalizer if it is not running
    pub fn start_finalizer(&self) -> Result<()> {
        let mut slot = self.finalizer.lock();
        if slot.is_none() {
            let interval = self.shared.config.finalizer.interval();
            *slot = Some(Finalizer::spawn(Arc::clone(&self.shared), interval)?);
        }
        Ok(())
    }

    /// Stop the background finalizer, waiting for its current pass
    pub fn stop_finalizer(&self) {
        let finalizer = self.finalizer.lock().take();
        if let Some(finalizer) = finalizer {
            finalizer.stop();
        }
    }

    /// Whether the background finalizer is running
    pub fn finalizer_running(&self) -> bool {
        self.finalizer.lock().is_some()
    }

    /// Wake the finalizer for a pass
    pub fn notify_finalizer(&self) {
        self.shared.signal.notify();
    }

    /// Run one finalizer pass on the calling thread
    pub fn finalize_now(&self) -> PassReport {
        finalizer::run_pass(&self.shared)
    }

    /// Flush persisted entries
    pub fn sync(&self) -> Result<()> {
        self.shared.entries.sync()
    }

    /// Strategy applied to the next submission
    pub fn mode(&self) -> DedupMode {
        self.shared.mode.mode()
    }

    /// Mode controller counters and active mode
    pub fn mode_state(&self) -> ModeState {
        self.shared.mode.state()
    }

    /// Engine statistics
    pub fn stats(&self) -> DedupStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Copy of an entry
    pub fn entry(&self, id: EntryId) -> Option<Entry> {
        self.shared.entries.get(id)
    }

    /// Entry owning `blocknr`, with its id
    pub fn entry_for_block(&self, blocknr: BlockNumber) -> Option<(EntryId, Entry)> {
        let id = self.shared.entries.owner_of(blocknr)?;
        self.shared
            .entries
            .get(id)
            .filter(|entry| entry.state != EntryState::Free && entry.blocknr == blocknr)
            .map(|entry| (id, entry))
    }

    /// Entry table occupancy
    pub fn census(&self) -> EntryCensus {
        self.shared.entries.census()
    }

    /// Number of free entry ids
    pub fn free_entries(&self) -> usize {
        self.shared.entries.free_count()
    }

    /// Fingerprint index
    pub fn index(&self) -> &FingerprintIndex {
        &self.shared.index
    }

    /// Backing block device
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.shared.device
    }
}

impl Drop for DedupEngine {
    fn drop(&mut self) {
        self.stop_finalizer();
        if let Err(e) = self.sync() {
            warn!("Failed to sync entry table on drop: {e}");
        }
    }
}

impl std::fmt::Debug for DedupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupEngine")
            .field("entries", &self.shared.entries)
            .field("index", &self.shared.index)
            .field("mode", &self.mode())
            .field("finalizer_running", &self.finalizer_running())
            .finish_non_exhaustive()
    }
}
