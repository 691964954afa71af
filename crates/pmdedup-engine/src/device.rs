//! Block device collaborators
//!
//! The engine never allocates physical blocks itself. It asks a
//! [`BlockDevice`] to allocate and durably write one block, reads stored
//! content back when it needs a digest of it, and hands blocks back on
//! reclamation.

use crate::block::BlockBitmap;
use crate::raw_io::RawFile;
use parking_lot::RwLock;
use pmdedup_common::{BLOCK_SIZE, Block, BlockNumber, Error, Result};
use std::path::Path;
use tracing::info;

/// Physical block store used by the dedup engine
pub trait BlockDevice: Send + Sync {
    /// Allocate a fresh block and write `content` to it
    ///
    /// Fails with [`Error::AllocationFailed`] when no block is free.
    fn write_new_block(&self, content: &Block) -> Result<BlockNumber>;

    /// Read back the content of an allocated block
    fn read_block(&self, blocknr: BlockNumber) -> Result<Block>;

    /// Return a block to the free pool
    fn release_block(&self, blocknr: BlockNumber) -> Result<()>;

    /// Mark a block as allocated without writing it (recovery)
    fn claim_block(&self, blocknr: BlockNumber) -> Result<()>;

    /// Total number of blocks
    fn capacity(&self) -> u64;

    /// Number of allocated blocks
    fn allocated(&self) -> u64;
}

/// Volatile device keeping every block in memory
pub struct MemDevice {
    bitmap: BlockBitmap,
    blocks: Vec<RwLock<Option<Box<Block>>>>,
}

impl MemDevice {
    /// Device with `capacity` free blocks
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(capacity: u64) -> Self {
        Self {
            bitmap: BlockBitmap::new(capacity),
            blocks: (0..capacity).map(|_| RwLock::new(None)).collect(),
        }
    }

    fn slot(&self, blocknr: BlockNumber) -> Result<&RwLock<Option<Box<Block>>>> {
        usize::try_from(blocknr.get())
            .ok()
            .and_then(|index| self.blocks.get(index))
            .ok_or(Error::BlockOutOfRange {
                blocknr,
                total: self.bitmap.total_count(),
            })
    }
}

impl BlockDevice for MemDevice {
    fn write_new_block(&self, content: &Block) -> Result<BlockNumber> {
        let blocknr = self
            .bitmap
            .allocate()
            .map(BlockNumber::new)
            .ok_or(Error::AllocationFailed {
                capacity: self.bitmap.total_count(),
            })?;
        *self.slot(blocknr)?.write() = Some(Box::new(*content));
        Ok(blocknr)
    }

    fn read_block(&self, blocknr: BlockNumber) -> Result<Block> {
        self.slot(blocknr)?
            .read()
            .as_deref()
            .copied()
            .ok_or(Error::BlockNotAllocated(blocknr))
    }

    fn release_block(&self, blocknr: BlockNumber) -> Result<()> {
        // The bit is freed last, with the slot still locked, so a writer
        // that reallocates this block stores its content after the clear.
        let mut slot = self.slot(blocknr)?.write();
        if !self.bitmap.is_allocated(blocknr.get()) {
            return Err(Error::BlockNotAllocated(blocknr));
        }
        *slot = None;
        self.bitmap.free(blocknr.get())
    }

    fn claim_block(&self, blocknr: BlockNumber) -> Result<()> {
        self.bitmap.claim(blocknr.get())
    }

    fn capacity(&self) -> u64 {
        self.bitmap.total_count()
    }

    fn allocated(&self) -> u64 {
        self.bitmap.allocated_count()
    }
}

/// Device storing blocks in a flat file, block `n` at offset `n * BLOCK_SIZE`
///
/// Allocation state is not persisted; it is rebuilt from the entry table
/// by claiming every referenced block on open.
pub struct FileDevice {
    file: RawFile,
    bitmap: BlockBitmap,
}

impl FileDevice {
    /// Create a data file holding `capacity` blocks
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let file = RawFile::create(path, capacity * BLOCK_SIZE as u64)?;
        info!("Created block file {} ({} blocks)", file.path(), capacity);
        Ok(Self {
            file,
            bitmap: BlockBitmap::new(capacity),
        })
    }

    /// Open an existing data file with every block unclaimed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = RawFile::open(path, false)?;
        let capacity = file.size() / BLOCK_SIZE as u64;
        info!("Opened block file {} ({} blocks)", file.path(), capacity);
        Ok(Self {
            file,
            bitmap: BlockBitmap::new(capacity),
        })
    }

    fn check(&self, blocknr: BlockNumber) -> Result<u64> {
        if blocknr.get() >= self.bitmap.total_count() {
            return Err(Error::BlockOutOfRange {
                blocknr,
                total: self.bitmap.total_count(),
            });
        }
        Ok(blocknr.get() * BLOCK_SIZE as u64)
    }
}

impl BlockDevice for FileDevice {
    fn write_new_block(&self, content: &Block) -> Result<BlockNumber> {
        let block = self.bitmap.allocate().ok_or(Error::AllocationFailed {
            capacity: self.bitmap.total_count(),
        })?;
        let blocknr = BlockNumber::new(block);

        if let Err(e) = self.file.write_at(block * BLOCK_SIZE as u64, content) {
            self.bitmap.free(block)?;
            return Err(e);
        }
        Ok(blocknr)
    }

    fn read_block(&self, blocknr: BlockNumber) -> Result<Block> {
        let offset = self.check(blocknr)?;
        if !self.bitmap.is_allocated(blocknr.get()) {
            return Err(Error::BlockNotAllocated(blocknr));
        }
        let mut content = [0u8; BLOCK_SIZE];
        self.file.read_at(offset, &mut content)?;
        Ok(content)
    }

    fn release_block(&self, blocknr: BlockNumber) -> Result<()> {
        self.check(blocknr)?;
        self.bitmap.free(blocknr.get())
    }

    fn claim_block(&self, blocknr: BlockNumber) -> Result<()> {
        self.bitmap.claim(blocknr.get())
    }

    fn capacity(&self) -> u64 {
        self.bitmap.total_count()
    }

    fn allocated(&self) -> u64 {
        self.bitmap.allocated_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn filled(byte: u8) -> Block {
        [byte; BLOCK_SIZE]
    }

    fn exercise(device: &dyn BlockDevice) {
        let a = device.write_new_block(&filled(1)).unwrap();
        let b = device.write_new_block(&filled(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(device.allocated(), 2);
        assert_eq!(device.read_block(b).unwrap(), filled(2));

        device.release_block(a).unwrap();
        assert!(matches!(
            device.read_block(a),
            Err(Error::BlockNotAllocated(_))
        ));
        assert!(matches!(
            device.release_block(a),
            Err(Error::BlockNotAllocated(_))
        ));

        // Fill up
        while device.allocated() < device.capacity() {
            device.write_new_block(&filled(3)).unwrap();
        }
        assert!(matches!(
            device.write_new_block(&filled(4)),
            Err(Error::AllocationFailed { .. })
        ));
    }

    #[test]
    fn test_mem_device() {
        let device = MemDevice::new(4);
        exercise(&device);
        assert!(matches!(
            device.read_block(BlockNumber::new(4)),
            Err(Error::BlockOutOfRange { total: 4, .. })
        ));
    }

    #[test]
    fn test_mem_device_reused_block_keeps_new_content() {
        let device = MemDevice::new(1);

        std::thread::scope(|scope| {
            for t in 0..8u8 {
                let device = &device;
                scope.spawn(move || {
                    let mut rounds = 0;
                    while rounds < 300 {
                        let blocknr = match device.write_new_block(&filled(t)) {
                            Ok(blocknr) => blocknr,
                            Err(Error::AllocationFailed { .. }) => {
                                std::thread::yield_now();
                                continue;
                            }
                            Err(e) => panic!("unexpected write error: {e}"),
                        };
                        assert_eq!(device.read_block(blocknr).unwrap(), filled(t));
                        device.release_block(blocknr).unwrap();
                        rounds += 1;
                    }
                });
            }
        });

        assert_eq!(device.allocated(), 0);
    }

    #[test]
    fn test_file_device() {
        let dir = tempdir().unwrap();
        let device = FileDevice::create(dir.path().join("blocks.dat"), 4).unwrap();
        exercise(&device);
    }

    #[test]
    fn test_file_device_reopen_and_claim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");

        let blocknr = {
            let device = FileDevice::create(&path, 8).unwrap();
            device.write_new_block(&filled(0)).unwrap();
            device.write_new_block(&filled(9)).unwrap()
        };

        let device = FileDevice::open(&path).unwrap();
        assert_eq!(device.capacity(), 8);
        assert_eq!(device.allocated(), 0);

        device.claim_block(blocknr).unwrap();
        assert_eq!(device.read_block(blocknr).unwrap(), filled(9));

        // Claimed block is skipped by allocation
        let fresh = device.write_new_block(&filled(5)).unwrap();
        assert_ne!(fresh, blocknr);
    }
}
