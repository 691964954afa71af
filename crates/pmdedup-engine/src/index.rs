//! Fingerprint index
//!
//! Two chained hash tables map fingerprints to entry ids: a weak table
//! used as a pre-filter and a strong table used as the equality
//! authority. Buckets are guarded by a pool of striped locks
//! (`bucket mod pool_size`); each node carries its own fingerprint so a
//! lookup never has to lock the entry it points to.
//!
//! Nodes may go stale between a lookup and its use. Callers re-check the
//! entry under its lock before acting on a hit.

use parking_lot::Mutex;
use pmdedup_common::{EntryId, StrongFingerprint, WeakFingerprint};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Key type of a fingerprint table
pub trait IndexKey: Copy + Eq + fmt::Debug + Send + Sync {
    /// Bucket selected by the low `bits` bits of the key
    fn bucket(&self, bits: u32) -> usize;
}

impl IndexKey for WeakFingerprint {
    fn bucket(&self, bits: u32) -> usize {
        Self::bucket(self, bits)
    }
}

impl IndexKey for StrongFingerprint {
    fn bucket(&self, bits: u32) -> usize {
        Self::bucket(self, bits)
    }
}

#[derive(Clone, Copy, Debug)]
struct Node<K> {
    key: K,
    id: EntryId,
}

/// Chained hash table from fingerprint to entry id
///
/// Insertion prepends to the chain: a lookup returns the most recently
/// inserted matching node.
pub struct HashTable<K> {
    /// stripe `s` holds buckets `s, s + pool, s + 2 * pool, ...`
    stripes: Vec<Mutex<Vec<Vec<Node<K>>>>>,
    bits: u32,
    nodes: AtomicUsize,
}

impl<K: IndexKey> HashTable<K> {
    /// Table with `2^bits` buckets spread over `pool_size` locks
    #[must_use]
    pub fn new(bits: u32, pool_size: usize) -> Self {
        let buckets = 1usize << bits;
        let pool = pool_size.clamp(1, buckets);

        let stripes = (0..pool)
            .map(|s| {
                let owned = (s..buckets).step_by(pool).count();
                Mutex::new(vec![Vec::new(); owned])
            })
            .collect();

        Self {
            stripes,
            bits,
            nodes: AtomicUsize::new(0),
        }
    }

    fn with_bucket<R>(&self, key: &K, f: impl FnOnce(&mut Vec<Node<K>>) -> R) -> R {
        let bucket = key.bucket(self.bits);
        let pool = self.stripes.len();
        let mut stripe = self.stripes[bucket % pool].lock();
        f(&mut stripe[bucket / pool])
    }

    /// Most recently inserted entry for `key`
    pub fn lookup(&self, key: &K) -> Option<EntryId> {
        self.with_bucket(key, |chain| {
            chain.iter().rev().find(|node| node.key == *key).map(|node| node.id)
        })
    }

    /// Prepend a node for `key`
    pub fn insert(&self, key: K, id: EntryId) {
        self.with_bucket(&key, |chain| chain.push(Node { key, id }));
        self.nodes.fetch_add(1, Ordering::Relaxed);
    }

    /// Insert unless a node for `key` exists; the existing id is returned as `Err`
    pub fn insert_if_absent(&self, key: K, id: EntryId) -> Result<(), EntryId> {
        self.with_bucket(&key, |chain| {
            if let Some(node) = chain.iter().rev().find(|node| node.key == key) {
                return Err(node.id);
            }
            chain.push(Node { key, id });
            Ok(())
        })?;
        self.nodes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unlink the node mapping `key` to `id`
    pub fn remove(&self, key: &K, id: EntryId) -> bool {
        let removed = self.with_bucket(key, |chain| {
            chain
                .iter()
                .rposition(|node| node.key == *key && node.id == id)
                .map(|pos| chain.remove(pos))
        });
        if removed.is_some() {
            self.nodes.fetch_sub(1, Ordering::Relaxed);
        }
        removed.is_some()
    }

    /// Number of nodes carrying `key`
    pub fn nodes_for(&self, key: &K) -> usize {
        self.with_bucket(key, |chain| chain.iter().filter(|node| node.key == *key).count())
    }

    /// Total number of nodes
    pub fn len(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    /// Check if the table has no nodes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets
    pub const fn bucket_count(&self) -> usize {
        1 << self.bits
    }
}

impl<K> fmt::Debug for HashTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTable")
            .field("bits", &self.bits)
            .field("stripes", &self.stripes.len())
            .field("nodes", &self.nodes.load(Ordering::Relaxed))
            .finish()
    }
}

/// The weak and strong fingerprint tables
#[derive(Debug)]
pub struct FingerprintIndex {
    /// Weak fingerprint pre-filter
    pub weak: HashTable<WeakFingerprint>,
    /// Strong fingerprint authority
    pub strong: HashTable<StrongFingerprint>,
}

impl FingerprintIndex {
    /// Empty index, both tables with `2^bits` buckets
    #[must_use]
    pub fn new(bits: u32, pool_size: usize) -> Self {
        Self {
            weak: HashTable::new(bits, pool_size),
            strong: HashTable::new(bits, pool_size),
        }
    }
}
