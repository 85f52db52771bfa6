//! In-memory storage medium with crash simulation.

use super::{MediumLock, StorageMedium};
use crate::error::{CountsError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One in-memory file: what has been written, and what has been fsynced.
#[derive(Clone, Debug, Default)]
struct MemoryFile {
    data: Vec<u8>,
    durable: Vec<u8>,
}

/// Injected failure for a path.
#[derive(Clone, Copy, Debug)]
struct FailPoint {
    /// Writes still allowed through before the failure triggers.
    writes_allowed: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, MemoryFile>,
    dirs: BTreeSet<PathBuf>,
    locks: BTreeSet<PathBuf>,
    fail_points: HashMap<PathBuf, FailPoint>,
}

impl MemoryState {
    fn check_write(&mut self, path: &Path) -> Result<()> {
        if let Some(point) = self.fail_points.get_mut(path) {
            if point.writes_allowed == 0 {
                return Err(injected(path));
            }
            point.writes_allowed -= 1;
        }
        Ok(())
    }

    fn check_sync(&self, path: &Path) -> Result<()> {
        match self.fail_points.get(path) {
            Some(point) if point.writes_allowed == 0 => Err(injected(path)),
            _ => Ok(()),
        }
    }
}

fn injected(path: &Path) -> CountsError {
    CountsError::Io(IoError::new(
        ErrorKind::Other,
        format!("injected write failure on {}", path.display()),
    ))
}

fn not_found(path: &Path) -> CountsError {
    CountsError::Io(IoError::new(
        ErrorKind::NotFound,
        format!("no such file: {}", path.display()),
    ))
}

/// Storage medium kept entirely in memory.
///
/// Clones share the same files. Tests use [`MemoryMedium::snapshot`] to
/// capture the filesystem as an abrupt process exit would leave it, and
/// [`MemoryMedium::crash`] to keep only what was fsynced.
#[derive(Clone, Debug, Default)]
pub struct MemoryMedium {
    state: Arc<Mutex<MemoryState>>,
}

struct MemoryLock {
    state: Arc<Mutex<MemoryState>>,
    path: PathBuf,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.state.lock().locks.remove(&self.path);
    }
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent copy of every file's current contents. Locks and
    /// injected failures are not carried over.
    pub fn snapshot(&self) -> MemoryMedium {
        self.copy_with(|file| file.data.clone())
    }

    /// Independent copy that keeps only fsynced contents, as after power
    /// loss.
    pub fn crash(&self) -> MemoryMedium {
        self.copy_with(|file| file.durable.clone())
    }

    fn copy_with(&self, contents: impl Fn(&MemoryFile) -> Vec<u8>) -> MemoryMedium {
        let state = self.state.lock();
        let files = state
            .files
            .iter()
            .map(|(path, file)| {
                let data = contents(file);
                (
                    path.clone(),
                    MemoryFile {
                        durable: data.clone(),
                        data,
                    },
                )
            })
            .collect();

        MemoryMedium {
            state: Arc::new(Mutex::new(MemoryState {
                files,
                dirs: state.dirs.clone(),
                ..Default::default()
            })),
        }
    }

    /// Fail every write, truncate and fsync on `path`.
    pub fn fail_writes_to(&self, path: impl AsRef<Path>) {
        self.fail_after_writes(path, 0);
    }

    /// Let `writes` more writes to `path` succeed, then fail.
    pub fn fail_after_writes(&self, path: impl AsRef<Path>, writes: usize) {
        self.state.lock().fail_points.insert(
            path.as_ref().to_path_buf(),
            FailPoint {
                writes_allowed: writes,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.state.lock().fail_points.clear();
    }
}

impl StorageMedium for MemoryMedium {
    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let file = state.files.get(path).ok_or_else(|| not_found(path))?;
        let start = (offset as usize).min(file.data.len());
        let end = (start + buf.len()).min(file.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&file.data[start..end]);
        Ok(n)
    }

    fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_write(path)?;
        let file = state.files.entry(path.to_path_buf()).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.check_write(path)?;
        let file = state.files.entry(path.to_path_buf()).or_default();
        file.data.resize(len as usize, 0);
        Ok(())
    }

    fn fsync(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        state.check_sync(path)?;
        let file = state.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.durable = file.data.clone();
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().files.remove(path).is_some())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state.lock();
        let file = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn len(&self, path: &Path) -> Result<Option<u64>> {
        Ok(self
            .state
            .lock()
            .files
            .get(path)
            .map(|f| f.data.len() as u64))
    }

    fn exists(&self, path: &Path) -> bool {
        self.state.lock().files.contains_key(path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .state
            .lock()
            .files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        self.state.lock().dirs.insert(dir.to_path_buf());
        Ok(())
    }

    fn lock(&self, path: &Path) -> Result<MediumLock> {
        let mut state = self.state.lock();
        if !state.locks.insert(path.to_path_buf()) {
            return Err(CountsError::Locked);
        }
        Ok(MediumLock::new(MemoryLock {
            state: Arc::clone(&self.state),
            path: path.to_path_buf(),
        }))
    }
}
