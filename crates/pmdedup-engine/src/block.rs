//! Physical block allocation
//!
//! Both block devices track which blocks hold data with a [`BlockBitmap`],
//! one bit per block packed into 64-bit words.

use parking_lot::RwLock;
use pmdedup_common::{BlockNumber, Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Word index and bit mask of `block`
#[allow(clippy::cast_possible_truncation)]
const fn locate(block: u64) -> (usize, u64) {
    ((block / 64) as usize, 1 << (block % 64))
}

/// Allocation bitmap of a block device
pub struct BlockBitmap {
    words: RwLock<Vec<u64>>,
    total: u64,
    free: AtomicU64,
    /// Next-fit cursor
    cursor: AtomicU64,
}

impl BlockBitmap {
    /// Bitmap of `total` free blocks
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(total: u64) -> Self {
        Self {
            words: RwLock::new(vec![0; total.div_ceil(64) as usize]),
            total,
            free: AtomicU64::new(total),
            cursor: AtomicU64::new(0),
        }
    }

    /// Whether `block` holds data; blocks past the end never do
    pub fn is_allocated(&self, block: u64) -> bool {
        if block >= self.total {
            return false;
        }
        let (word, mask) = locate(block);
        self.words.read()[word] & mask != 0
    }

    /// Take the first free block at or after the cursor, wrapping once
    pub fn allocate(&self) -> Option<u64> {
        let mut words = self.words.write();
        let cursor = self.cursor.load(Ordering::Relaxed).min(self.total);

        let block = (cursor..self.total).chain(0..cursor).find(|&block| {
            let (word, mask) = locate(block);
            words[word] & mask == 0
        })?;

        let (word, mask) = locate(block);
        words[word] |= mask;
        self.free.fetch_sub(1, Ordering::Relaxed);
        self.cursor.store(block + 1, Ordering::Relaxed);
        Some(block)
    }

    /// Mark `block` used without going through the cursor
    pub fn claim(&self, block: u64) -> Result<()> {
        let (word, mask) = self.locate_checked(block)?;
        let mut words = self.words.write();
        if words[word] & mask != 0 {
            return Err(Error::invariant(format!("block {block} claimed twice")));
        }
        words[word] |= mask;
        self.free.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Return `block` to the pool and pull the cursor back to it
    pub fn free(&self, block: u64) -> Result<()> {
        let (word, mask) = self.locate_checked(block)?;
        let mut words = self.words.write();
        if words[word] & mask == 0 {
            return Err(Error::BlockNotAllocated(BlockNumber::new(block)));
        }
        words[word] &= !mask;
        self.free.fetch_add(1, Ordering::Relaxed);
        self.cursor.fetch_min(block, Ordering::Relaxed);
        Ok(())
    }

    fn locate_checked(&self, block: u64) -> Result<(usize, u64)> {
        if block >= self.total {
            return Err(Error::BlockOutOfRange {
                blocknr: BlockNumber::new(block),
                total: self.total,
            });
        }
        Ok(locate(block))
    }

    pub fn free_count(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    pub const fn total_count(&self) -> u64 {
        self.total
    }

    pub fn allocated_count(&self) -> u64 {
        self.total - self.free_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_allocate() {
        let bitmap = BlockBitmap::new(100);
        assert_eq!(bitmap.free_count(), 100);

        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.free_count(), 99);
        assert!(bitmap.is_allocated(0));

        assert_eq!(bitmap.allocate(), Some(1));
        assert_eq!(bitmap.allocated_count(), 2);
        assert!(!bitmap.is_allocated(100));
    }

    #[test]
    fn test_bitmap_free_rewinds_cursor() {
        let bitmap = BlockBitmap::new(100);

        for _ in 0..5 {
            bitmap.allocate().unwrap();
        }
        bitmap.free(2).unwrap();
        assert!(!bitmap.is_allocated(2));
        assert_eq!(bitmap.allocate(), Some(2));
        assert_eq!(bitmap.allocate(), Some(5));
    }

    #[test]
    fn test_bitmap_spans_words() {
        let bitmap = BlockBitmap::new(130);
        for expected in 0..130 {
            assert_eq!(bitmap.allocate(), Some(expected));
        }
        assert_eq!(bitmap.allocate(), None);
        assert_eq!(bitmap.free_count(), 0);

        bitmap.free(64).unwrap();
        bitmap.free(129).unwrap();
        assert!(bitmap.is_allocated(63));
        assert!(!bitmap.is_allocated(64));
        assert_eq!(bitmap.allocate(), Some(64));
        assert_eq!(bitmap.allocate(), Some(129));
    }

    #[test]
    fn test_bitmap_wraps_around() {
        let bitmap = BlockBitmap::new(4);
        for _ in 0..4 {
            bitmap.allocate().unwrap();
        }
        bitmap.free(3).unwrap();
        bitmap.free(0).unwrap();

        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.allocate(), Some(3));
        assert_eq!(bitmap.allocate(), None);
    }

    #[test]
    fn test_bitmap_claim_and_errors() {
        let bitmap = BlockBitmap::new(8);

        bitmap.claim(3).unwrap();
        assert!(bitmap.is_allocated(3));
        assert_eq!(bitmap.free_count(), 7);
        assert!(matches!(bitmap.claim(3), Err(Error::InvariantViolation(_))));

        assert!(matches!(bitmap.free(4), Err(Error::BlockNotAllocated(_))));
        assert!(matches!(
            bitmap.free(8),
            Err(Error::BlockOutOfRange { total: 8, .. })
        ));
    }
}
