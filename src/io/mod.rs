//! Storage medium abstraction.
//!
//! Every durable file the database touches goes through a [`StorageMedium`],
//! so the same code runs against the real filesystem and against an
//! in-memory medium that can simulate crashes and write failures.

mod disk;
mod memory;

pub use disk::DiskMedium;
pub use memory::MemoryMedium;

use crate::error::Result;
use std::fmt;
use std::path::{Path, PathBuf};

/// Exclusive lock on a path, released when dropped.
pub struct MediumLock {
    _guard: Box<dyn Send + Sync>,
}

impl MediumLock {
    pub(crate) fn new(guard: impl Send + Sync + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl fmt::Debug for MediumLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MediumLock")
    }
}

/// Byte-level file access used by the counts store, log and graph image.
pub trait StorageMedium: Send + Sync + fmt::Debug {
    /// Read into `buf` starting at `offset`. Returns the number of bytes
    /// read, which is short only at end of file.
    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` at `offset`, creating the file if needed and zero-filling
    /// any gap.
    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()>;

    /// Cut or extend the file to `len` bytes.
    fn truncate(&self, path: &Path, len: u64) -> Result<()>;

    /// Make everything written to `path` so far durable.
    fn fsync(&self, path: &Path) -> Result<()>;

    /// Delete a file. Returns false when it did not exist.
    fn delete(&self, path: &Path) -> Result<bool>;

    /// Atomically replace `to` with `from`.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// File length, or `None` when it does not exist.
    fn len(&self, path: &Path) -> Result<Option<u64>>;

    fn exists(&self, path: &Path) -> bool;

    /// Files directly inside `dir`, sorted by path.
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    fn create_dir_all(&self, dir: &Path) -> Result<()>;

    /// Take an exclusive lock on `path`. Fails with `Locked` when it is
    /// already held.
    fn lock(&self, path: &Path) -> Result<MediumLock>;

    /// Read a whole file, or `None` when it does not exist.
    fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let len = match self.len(path)? {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        let mut buf = vec![0u8; len];
        let read = self.read_at(path, 0, &mut buf)?;
        buf.truncate(read);
        Ok(Some(buf))
    }

    /// Replace a file's contents durably: write a sibling temp file, fsync
    /// it, then rename it over `path`.
    fn replace_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        self.delete(&tmp)?;
        self.write_at(&tmp, 0, data)?;
        self.fsync(&tmp)?;
        self.rename(&tmp, path)
    }
}
