//! Striped entry store

use super::{Entry, EntryCensus, EntryState, EntryTable, FreeList};
use dashmap::DashMap;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use pmdedup_common::{BlockNumber, EntryId, Error, Result};
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Fixed table of metadata entries
///
/// Entry `id` lives in stripe `id % pool_size` at slot `id / pool_size`,
/// so one lock guards every entry of its stripe.
pub struct EntryStore {
    stripes: Vec<Mutex<Vec<Entry>>>,
    capacity: u64,
    free_list: FreeList,
    /// blocknr -> owning entry, for every non-free entry
    reverse: DashMap<BlockNumber, EntryId>,
    table: Option<EntryTable>,
    next_txid: AtomicU64,
}

/// Every entry free, or a configuration error if `capacity` entries cannot be held in memory
fn blank(capacity: u64) -> Result<Vec<Entry>> {
    let limit = isize::MAX.unsigned_abs() / std::mem::size_of::<Entry>();
    usize::try_from(capacity)
        .ok()
        .filter(|&len| len <= limit)
        .map(|len| vec![Entry::default(); len])
        .ok_or_else(|| Error::configuration(format!("entry capacity {capacity} is too large")))
}

impl EntryStore {
    /// Volatile store with every entry free
    pub fn in_memory(capacity: u64, pool_size: usize) -> Result<Self> {
        Ok(Self::build(blank(capacity)?, pool_size, None))
    }

    /// Persistent store backed by a new table file
    pub fn create(path: impl AsRef<Path>, capacity: u64, pool_size: usize) -> Result<Self> {
        let entries = blank(capacity)?;
        let table = EntryTable::create(path, capacity)?;
        Ok(Self::build(entries, pool_size, Some(table)))
    }

    /// Reopen a persistent store, rebuilding the free list and reverse map
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        Self::recover(EntryTable::open(path)?, pool_size)
    }

    /// Reopen a persistent store whose entries can be read but not changed
    pub fn open_read_only(path: impl AsRef<Path>, pool_size: usize) -> Result<Self> {
        Self::recover(EntryTable::open_read_only(path)?, pool_size)
    }

    fn recover((table, entries): (EntryTable, Vec<Entry>), pool_size: usize) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for (i, entry) in entries.iter().enumerate() {
            if entry.state != EntryState::Free && !seen.insert(entry.blocknr) {
                return Err(Error::Corruption(format!(
                    "block {} owned by more than one entry (second owner {i})",
                    entry.blocknr
                )));
            }
        }

        let store = Self::build(entries, pool_size, Some(table));
        info!(
            "Recovered entry store: {} free, {} in use",
            store.free_count(),
            store.reverse.len()
        );
        Ok(store)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn build(entries: Vec<Entry>, pool_size: usize, table: Option<EntryTable>) -> Self {
        let pool_size = pool_size.max(1);
        let capacity = entries.len() as u64;

        let mut stripes: Vec<Vec<Entry>> = (0..pool_size).map(|_| Vec::new()).collect();
        let mut free_ids = Vec::new();
        let reverse = DashMap::new();
        let mut max_txid = 0;

        for (i, entry) in entries.into_iter().enumerate() {
            let id = EntryId::new(i as u64);
            if entry.state == EntryState::Free {
                free_ids.push(id);
            } else {
                reverse.insert(entry.blocknr, id);
            }
            max_txid = max_txid.max(entry.txid);
            stripes[i % pool_size].push(entry);
        }

        Self {
            stripes: stripes.into_iter().map(Mutex::new).collect(),
            capacity,
            free_list: FreeList::from_ids(free_ids),
            reverse,
            table,
            next_txid: AtomicU64::new(max_txid + 1),
        }
    }

    /// Total number of entries
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of ids on the free list
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Take a free entry id
    ///
    /// Running out of entries means more blocks are in use than entries
    /// exist, which the sizing rules forbid.
    pub fn allocate(&self) -> Result<EntryId> {
        self.free_list.pop().ok_or_else(|| {
            error!(
                "Entry free list exhausted ({} entries all in use)",
                self.capacity
            );
            Error::invariant(format!(
                "entry free list exhausted with capacity {}",
                self.capacity
            ))
        })
    }

    /// Return an entry id to the free list
    ///
    /// The entry must already be cleared and its lock released.
    pub fn free(&self, id: EntryId) {
        self.free_list.push(id);
    }

    /// Lock an entry for reading or mutation
    pub fn lock(&self, id: EntryId) -> Result<EntryGuard<'_>> {
        if id.get() >= self.capacity {
            return Err(Error::invariant(format!(
                "entry {id} out of range (capacity {})",
                self.capacity
            )));
        }

        let pool = self.stripes.len();
        let slot = id.index() / pool;
        let stripe = self.stripes[id.index() % pool].lock();
        let entry = MutexGuard::map(stripe, |entries| &mut entries[slot]);

        Ok(EntryGuard {
            id,
            entry,
            store: self,
        })
    }

    /// Copy of an entry
    pub fn get(&self, id: EntryId) -> Option<Entry> {
        self.lock(id).ok().map(|guard| Entry::clone(&guard))
    }

    /// Record that `blocknr` is owned by entry `id`
    pub fn bind_block(&self, blocknr: BlockNumber, id: EntryId) {
        if let Some(previous) = self.reverse.insert(blocknr, id) {
            debug!("Block {blocknr} rebound from entry {previous} to {id}");
        }
    }

    /// Entry currently owning `blocknr`
    pub fn owner_of(&self, blocknr: BlockNumber) -> Option<EntryId> {
        self.reverse.get(&blocknr).map(|owner| *owner)
    }

    /// Drop the `blocknr -> id` binding if it is still current
    pub fn unbind_block(&self, blocknr: BlockNumber, id: EntryId) -> bool {
        self.reverse
            .remove_if(&blocknr, |_, owner| *owner == id)
            .is_some()
    }

    /// Entries that are not free, with their ids
    #[allow(clippy::cast_possible_truncation)]
    pub fn occupied(&self) -> Vec<(EntryId, Entry)> {
        let pool = self.stripes.len();
        let mut found = Vec::new();
        for (s, stripe) in self.stripes.iter().enumerate() {
            let entries = stripe.lock();
            for (slot, entry) in entries.iter().enumerate() {
                if entry.state != EntryState::Free {
                    found.push((EntryId::new((slot * pool + s) as u64), entry.clone()));
                }
            }
        }
        found.sort_by_key(|(id, _)| *id);
        found
    }

    /// Count entries by liveness
    ///
    /// Stripes are visited one at a time, so the result is only exact
    /// when no writer is active.
    pub fn census(&self) -> EntryCensus {
        let mut census = EntryCensus::default();
        for stripe in &self.stripes {
            for entry in stripe.lock().iter() {
                if entry.state == EntryState::Free {
                    census.free += 1;
                } else if entry.refcount == 0 {
                    census.pending += 1;
                } else {
                    census.live += 1;
                }
                census.references += entry.refcount;
            }
        }
        census
    }

    /// Flush the table file, if any
    pub fn sync(&self) -> Result<()> {
        self.table.as_ref().map_or(Ok(()), EntryTable::sync)
    }

    /// Whether mutations are persisted
    pub const fn is_persistent(&self) -> bool {
        self.table.is_some()
    }
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("capacity", &self.capacity)
            .field("stripes", &self.stripes.len())
            .field("free", &self.free_list.len())
            .field("persistent", &self.table.is_some())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to one entry while its stripe lock is held
pub struct EntryGuard<'a> {
    id: EntryId,
    entry: MappedMutexGuard<'a, Entry>,
    store: &'a EntryStore,
}

impl EntryGuard<'_> {
    /// Id of the locked entry
    pub const fn id(&self) -> EntryId {
        self.id
    }

    /// Apply `change` to a copy of the entry, persist the copy under a new
    /// transaction id, then install it
    ///
    /// If the table write fails the entry is left as it was.
    pub fn update(&mut self, change: impl FnOnce(&mut Entry)) -> Result<()> {
        let mut next = Entry::clone(&self.entry);
        change(&mut next);
        next.txid = self.store.next_txid.fetch_add(1, Ordering::Relaxed);

        if let Some(table) = &self.store.table {
            table.write(self.id, &next)?;
        }
        *self.entry = next;
        Ok(())
    }
}

impl Deref for EntryGuard<'_> {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        &self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmdedup_common::{StrongFingerprint, WeakFingerprint};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn populate(store: &EntryStore, blocknr: u64, state: EntryState) -> EntryId {
        let id = store.allocate().unwrap();
        let mut entry = store.lock(id).unwrap();
        entry
            .update(|e| {
                *e = Entry::new(
                    BlockNumber::new(blocknr),
                    WeakFingerprint(blocknr as u32),
                    StrongFingerprint([blocknr, 0, 0, 0]),
                    state,
                );
            })
            .unwrap();
        store.bind_block(BlockNumber::new(blocknr), id);
        id
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let store = EntryStore::in_memory(3, 2).unwrap();
        let ids: Vec<_> = (0..3).map(|_| store.allocate().unwrap()).collect();
        assert_eq!(ids, vec![EntryId::new(0), EntryId::new(1), EntryId::new(2)]);

        let err = store.allocate().unwrap_err();
        assert!(err.is_fatal());

        store.free(EntryId::new(1));
        assert_eq!(store.allocate().unwrap(), EntryId::new(1));
    }

    #[test]
    fn test_lock_out_of_range() {
        let store = EntryStore::in_memory(4, 2).unwrap();
        assert!(matches!(
            store.lock(EntryId::new(4)),
            Err(Error::InvariantViolation(_))
        ));
        assert!(store.get(EntryId::new(9)).is_none());
    }

    #[test]
    fn test_striping_maps_each_id_to_its_own_slot() {
        let store = EntryStore::in_memory(10, 3).unwrap();
        for i in 0..10 {
            let mut entry = store.lock(EntryId::new(i)).unwrap();
            entry.update(|e| e.refcount = i + 100).unwrap();
        }
        for i in 0..10 {
            assert_eq!(store.get(EntryId::new(i)).unwrap().refcount, i + 100);
        }
    }

    #[test]
    fn test_reverse_map_unbind_requires_current_owner() {
        let store = EntryStore::in_memory(4, 2).unwrap();
        let id = populate(&store, 7, EntryState::WeakValid);
        assert_eq!(store.owner_of(BlockNumber::new(7)), Some(id));

        assert!(!store.unbind_block(BlockNumber::new(7), EntryId::new(3)));
        assert_eq!(store.owner_of(BlockNumber::new(7)), Some(id));

        assert!(store.unbind_block(BlockNumber::new(7), id));
        assert_eq!(store.owner_of(BlockNumber::new(7)), None);
    }

    #[test]
    fn test_census_counts_states() {
        let store = EntryStore::in_memory(8, 4).unwrap();
        populate(&store, 1, EntryState::WeakValid);
        let pending = populate(&store, 2, EntryState::Unfinalized);
        store.lock(pending).unwrap().update(|e| e.refcount = 0).unwrap();
        let shared = populate(&store, 3, EntryState::StrongValid);
        store.lock(shared).unwrap().update(|e| e.refcount = 4).unwrap();

        let census = store.census();
        assert_eq!(census.live, 2);
        assert_eq!(census.pending, 1);
        assert_eq!(census.free, 5);
        assert_eq!(census.references, 5);
        assert_eq!(census.total(), 8);
        assert_eq!(store.occupied().len(), 3);
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.tbl");

        let (kept, txid) = {
            let store = EntryStore::create(&path, 16, 4).unwrap();
            let kept = populate(&store, 11, EntryState::StrongValid);
            let gone = populate(&store, 12, EntryState::WeakValid);
            {
                let mut entry = store.lock(gone).unwrap();
                entry.update(Entry::clear).unwrap();
            }
            store.unbind_block(BlockNumber::new(12), gone);
            store.free(gone);
            store.sync().unwrap();
            (kept, store.get(kept).unwrap().txid)
        };

        let store = EntryStore::open(&path, 4).unwrap();
        assert_eq!(store.capacity(), 16);
        assert_eq!(store.free_count(), 15);
        assert_eq!(store.owner_of(BlockNumber::new(11)), Some(kept));
        assert_eq!(store.owner_of(BlockNumber::new(12)), None);

        let entry = store.get(kept).unwrap();
        assert_eq!(entry.state, EntryState::StrongValid);
        assert_eq!(entry.txid, txid);

        // New mutations continue the transaction sequence
        let mut guard = store.lock(kept).unwrap();
        guard.update(|_| {}).unwrap();
        assert!(guard.txid > 3);
    }

    #[test]
    fn test_concurrent_refcount_updates() {
        let store = Arc::new(EntryStore::in_memory(4, 2).unwrap());
        let id = populate(&store, 1, EntryState::StrongValid);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.lock(id).unwrap().update(|e| e.refcount += 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get(id).unwrap().refcount, 8001);
    }

    #[test]
    fn test_oversized_capacity_rejected() {
        assert!(matches!(
            EntryStore::in_memory(u64::MAX, 4),
            Err(Error::Configuration(_))
        ));

        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.tbl");
        assert!(matches!(
            EntryStore::create(&path, u64::MAX, 4),
            Err(Error::Configuration(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_update_leaves_entry_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.tbl");
        let id = {
            let store = EntryStore::create(&path, 4, 2).unwrap();
            populate(&store, 5, EntryState::StrongValid)
        };

        let store = EntryStore::open_read_only(&path, 2).unwrap();
        let before = store.get(id).unwrap();

        let mut entry = store.lock(id).unwrap();
        assert!(matches!(
            entry.update(|e| e.refcount += 1),
            Err(Error::Storage(_))
        ));
        assert_eq!(*entry, before);
        drop(entry);

        assert_eq!(store.owner_of(BlockNumber::new(5)), Some(id));
        assert!(store.sync().is_ok());
    }
}
