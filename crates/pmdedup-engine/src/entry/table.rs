//! Persistent entry table file

use super::Entry;
use crate::layout::{ENTRY_SIZE, ENTRY_TABLE_OFFSET, HEADER_SIZE, TableHeader, entry_offset, table_size};
use crate::raw_io::RawFile;
use pmdedup_common::{EntryId, Error, Result};
use std::path::Path;
use tracing::info;

/// Fixed-stride array of 64-byte entry records behind a table header
#[derive(Debug)]
pub struct EntryTable {
    file: RawFile,
    header: TableHeader,
}

impl EntryTable {
    /// Create a new table with every record free
    pub fn create(path: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let file = RawFile::create(&path, table_size(capacity))?;
        let header = TableHeader::new(capacity);

        // set_len zero-fills, and an all-zero record decodes as a free entry
        file.write_at(0, &header.to_bytes())?;
        file.sync()?;

        info!(
            "Created entry table {} ({} entries, uuid {})",
            file.path(),
            capacity,
            header.table_uuid
        );
        Ok(Self { file, header })
    }

    /// Open an existing table and load every record
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Entry>)> {
        Self::load(path, false)
    }

    /// Open an existing table for inspection; every record write fails
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<(Self, Vec<Entry>)> {
        Self::load(path, true)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn load(path: impl AsRef<Path>, read_only: bool) -> Result<(Self, Vec<Entry>)> {
        let file = RawFile::open(&path, read_only)?;

        let mut header_buf = vec![0u8; HEADER_SIZE as usize];
        file.read_at(0, &mut header_buf)?;
        let header = TableHeader::from_bytes(&header_buf)?;

        let expected = table_size(header.capacity);
        if file.size() < expected {
            return Err(Error::Corruption(format!(
                "entry table {} truncated: {} bytes, expected {}",
                file.path(),
                file.size(),
                expected
            )));
        }

        let mut records = vec![0u8; header.capacity as usize * ENTRY_SIZE];
        file.read_at(ENTRY_TABLE_OFFSET, &mut records)?;

        let entries = records
            .chunks_exact(ENTRY_SIZE)
            .map(Entry::from_record)
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Opened entry table {} ({} entries, uuid {})",
            file.path(),
            header.capacity,
            header.table_uuid
        );
        Ok((Self { file, header }, entries))
    }

    /// Number of records in the table
    pub const fn capacity(&self) -> u64 {
        self.header.capacity
    }

    /// Table header
    pub const fn header(&self) -> &TableHeader {
        &self.header
    }

    /// Persist one record
    pub fn write(&self, id: EntryId, entry: &Entry) -> Result<()> {
        self.file.write_at(entry_offset(id.get()), &entry.to_record())
    }

    /// Sync records to disk
    pub fn sync(&self) -> Result<()> {
        if self.file.is_read_only() {
            return Ok(());
        }
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryState;
    use pmdedup_common::{BlockNumber, StrongFingerprint, WeakFingerprint};
    use tempfile::tempdir;

    #[test]
    fn test_table_create_open_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.tbl");

        let entry = Entry {
            txid: 4,
            ..Entry::new(
                BlockNumber::new(9),
                WeakFingerprint(0x55),
                StrongFingerprint([9, 8, 7, 6]),
                EntryState::StrongValid,
            )
        };

        {
            let table = EntryTable::create(&path, 8).unwrap();
            table.write(EntryId::new(3), &entry).unwrap();
            table.sync().unwrap();
        }

        let (table, entries) = EntryTable::open(&path).unwrap();
        assert_eq!(table.capacity(), 8);
        assert_eq!(entries.len(), 8);
        assert_eq!(entries[3], entry);
        assert_eq!(entries[0].state, EntryState::Free);
    }

    #[test]
    fn test_table_open_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.tbl");
        EntryTable::create(&path, 8).unwrap();

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(HEADER_SIZE + 64).unwrap();

        assert!(matches!(
            EntryTable::open(&path),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_table_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.tbl");
        EntryTable::create(&path, 4).unwrap();

        let (table, entries) = EntryTable::open_read_only(&path).unwrap();
        assert_eq!(entries.len(), 4);
        assert!(matches!(
            table.write(EntryId::new(0), &entries[0]),
            Err(Error::Storage(_))
        ));
        table.sync().unwrap();
    }
}
