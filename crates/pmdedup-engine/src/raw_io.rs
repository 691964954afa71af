//! Positioned file I/O
//!
//! Block data and entry records are read and written concurrently from
//! many threads, so every access is a positioned `pread`/`pwrite` on a
//! shared handle rather than seek-then-read.

use pmdedup_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// File handle for positioned reads and writes
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
}

impl RawFile {
    /// Open an existing file
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {path_str}: {e}")))?;

        let size = file
            .metadata()
            .map_err(|e| Error::Storage(format!("failed to get metadata for {path_str}: {e}")))?
            .len();

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
        })
    }

    /// Create (or truncate) a file with the given size
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {path_str}: {e}")))?;

        file.set_len(size)
            .map_err(|e| Error::Storage(format!("failed to set size for {path_str}: {e}")))?;

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only: false,
        })
    }

    /// Get the file size
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Fill `buf` from the given offset
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Storage(format!("read failed on {}: {e}", self.path)))
    }

    /// Write all of `buf` at the given offset
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::Storage("file is read-only".into()));
        }
        self.check_range(offset, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::Storage(format!("write failed on {}: {e}", self.path)))
    }

    /// Sync data to disk
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::Storage(format!("sync failed on {}: {e}", self.path)))
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync_data failed on {}: {e}", self.path)))
    }

    /// Reject accesses past the end of the file
    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset.saturating_add(len as u64);
        if end > self.size {
            return Err(Error::Storage(format!(
                "access {offset}..{end} beyond end of {} ({} bytes)",
                self.path, self.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_raw_file_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        {
            let file = RawFile::create(path, 8192).unwrap();
            file.write_at(4096, b"test data pattern").unwrap();
            file.sync().unwrap();
        }

        {
            let file = RawFile::open(path, true).unwrap();
            assert_eq!(file.size(), 8192);
            let mut buf = [0u8; 17];
            file.read_at(4096, &mut buf).unwrap();
            assert_eq!(&buf, b"test data pattern");
        }
    }

    #[test]
    fn test_raw_file_bounds_and_read_only() {
        let temp = NamedTempFile::new().unwrap();
        let file = RawFile::create(temp.path(), 64).unwrap();

        let mut buf = [0u8; 16];
        assert!(file.read_at(56, &mut buf).is_err());
        assert!(file.write_at(60, &buf).is_err());

        let ro = RawFile::open(temp.path(), true).unwrap();
        assert!(ro.write_at(0, &buf).is_err());
    }
}
