//! Entry table layout definitions
//!
//! Metadata file layout:
//! ```text
//! +------------------+  offset 0
//! |   Table header   |  4KB - Magic, version, UUID, capacity, checksum
//! +------------------+  offset 4096 (ENTRY_TABLE_OFFSET)
//! |   Entry 0        |  64 bytes
//! |   Entry 1        |  64 bytes
//! |   ...            |
//! |   Entry N-1      |  64 bytes
//! +------------------+
//! ```
//!
//! Entry record (64 bytes, little-endian):
//! ```text
//! | txid:8 | refcount:8 | blocknr:8 | strong_fp:32 | weak_fp:4 | state:1 | pad:3 |
//! ```
//!
//! The fingerprint index is volatile; it is rebuilt by rescanning the
//! records on open.

use crate::entry::{Entry, EntryState};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pmdedup_common::{BlockNumber, Error, Result, StrongFingerprint, WeakFingerprint};
use uuid::Uuid;

/// Magic number for the entry table file
pub const MAGIC: [u8; 8] = *b"PMDEDUP\0";

/// Current table format version
pub const FORMAT_VERSION: u32 = 1;

/// Header size (4KB)
pub const HEADER_SIZE: u64 = 4096;

/// Offset of entry 0 in the table file
pub const ENTRY_TABLE_OFFSET: u64 = HEADER_SIZE;

/// Size of one persisted entry record
pub const ENTRY_SIZE: usize = 64;

/// Byte offset of an entry record in the table file
#[must_use]
pub const fn entry_offset(index: u64) -> u64 {
    ENTRY_TABLE_OFFSET + index * ENTRY_SIZE as u64
}

/// Total file size for a table of `capacity` entries
#[must_use]
pub const fn table_size(capacity: u64) -> u64 {
    entry_offset(capacity)
}

/// Header stored at the beginning of the entry table file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableHeader {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Unique table identifier
    pub table_uuid: Uuid,
    /// Number of entry records
    pub capacity: u64,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
    /// Checksum of header (excluding this field)
    pub checksum: u32,
}

impl TableHeader {
    /// magic(8) + version(4) + uuid(16) + capacity(8) + created_at(8)
    const CHECKSUM_OFFSET: usize = 44;

    /// Create a header for a new table
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut header = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            table_uuid: Uuid::new_v4(),
            capacity,
            created_at,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    /// Serialize header to bytes (padded to `HEADER_SIZE`)
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);

        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.table_uuid.as_bytes());
        buf.put_u64_le(self.capacity);
        buf.put_u64_le(self.created_at);
        buf.put_u32_le(self.checksum);

        buf.resize(HEADER_SIZE as usize, 0);
        buf.freeze()
    }

    /// Parse and verify a header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::CHECKSUM_OFFSET + 4 {
            return Err(Error::Corruption("table header too small".into()));
        }

        let mut buf = data;

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::Corruption("invalid table magic".into()));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported table format version: {version}"
            )));
        }

        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let table_uuid = Uuid::from_bytes(uuid_bytes);

        let capacity = buf.get_u64_le();
        let created_at = buf.get_u64_le();
        let checksum = buf.get_u32_le();

        let header = Self {
            magic,
            version,
            table_uuid,
            capacity,
            created_at,
            checksum,
        };

        if header.compute_checksum() != checksum {
            return Err(Error::Corruption("table header checksum mismatch".into()));
        }

        Ok(header)
    }

    /// Compute checksum of header (CRC32C)
    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32c::crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }
}

impl EntryState {
    /// On-disk state byte
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Free => 0x00,
            Self::Unfinalized => 0xFF,
            Self::WeakValid => 0xFE,
            Self::StrongValid => 0xEF,
        }
    }

    /// Decode an on-disk state byte
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x00 => Ok(Self::Free),
            0xFF => Ok(Self::Unfinalized),
            0xFE => Ok(Self::WeakValid),
            0xEF => Ok(Self::StrongValid),
            other => Err(Error::Corruption(format!(
                "unknown entry state byte {other:#04x}"
            ))),
        }
    }
}

impl Entry {
    /// Encode into the fixed 64-byte record layout
    #[must_use]
    pub fn to_record(&self) -> [u8; ENTRY_SIZE] {
        let mut record = [0u8; ENTRY_SIZE];
        let mut buf = &mut record[..];

        buf.put_u64_le(self.txid);
        buf.put_u64_le(self.refcount);
        buf.put_u64_le(self.blocknr.get());
        for word in self.fp_strong.0 {
            buf.put_u64_le(word);
        }
        buf.put_u32_le(self.fp_weak.0);
        buf.put_u8(self.state.to_byte());
        // 3 bytes padding stay zero

        record
    }

    /// Decode a 64-byte record
    pub fn from_record(record: &[u8]) -> Result<Self> {
        if record.len() < ENTRY_SIZE {
            return Err(Error::Corruption(format!(
                "entry record too small: {} bytes",
                record.len()
            )));
        }

        let mut buf = record;
        let txid = buf.get_u64_le();
        let refcount = buf.get_u64_le();
        let blocknr = BlockNumber::new(buf.get_u64_le());
        let mut words = [0u64; 4];
        for word in &mut words {
            *word = buf.get_u64_le();
        }
        let fp_weak = WeakFingerprint(buf.get_u32_le());
        let state = EntryState::from_byte(buf.get_u8())?;

        Ok(Self {
            txid,
            refcount,
            blocknr,
            fp_strong: StrongFingerprint(words),
            fp_weak,
            state,
        })
    }
}
