//! Dual-generation persistence of the counter table.
//!
//! Two files, `A` and `B`, each hold a full image of the counter table
//! stamped with the transaction id it reflects. Writes always go to the
//! generation that is *not* active, body first and header last, so a crash
//! mid-write can only damage the copy that was going to be replaced anyway.
//!
//! ## File layout
//!
//! ```text
//! 0..4    magic "CNT\0"
//! 4..8    format version (u32 LE)
//! 8..16   transaction id (u64 LE)
//! 16..20  entry count (u32 LE)
//! 20..24  reserved, zero
//! 24..32  checksum (u64 LE)
//! 32..    entries: key (5 bytes) + count (i64 LE), in key order
//! ```
//!
//! The checksum is the first 8 bytes of SHA-256 over the format version,
//! transaction id, entry count and body.

use super::key::{CounterKey, KEY_SIZE};
use super::table::CounterTable;
use crate::error::{CountsError, Result};
use crate::io::StorageMedium;
use crate::types::TransactionId;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// File name of generation `A`.
pub const COUNTS_STORE_A: &str = "neostore.counts.db.a";

/// File name of generation `B`.
pub const COUNTS_STORE_B: &str = "neostore.counts.db.b";

/// Magic bytes for counts store files.
const COUNTS_MAGIC: &[u8; 4] = b"CNT\0";

/// Current counts store format version.
pub const COUNTS_FORMAT_VERSION: u32 = 1;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 32;

/// Size of one serialized entry.
const ENTRY_SIZE: usize = KEY_SIZE + 8;

/// One of the two alternating images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Generation {
    A,
    B,
}

impl Generation {
    pub fn other(self) -> Self {
        match self {
            Generation::A => Generation::B,
            Generation::B => Generation::A,
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::A => write!(f, "A"),
            Generation::B => write!(f, "B"),
        }
    }
}

/// Header of a generation file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GenerationHeader {
    pub transaction_id: TransactionId,
    pub format_version: u32,
    pub entry_count: u32,
    pub checksum: u64,
}

impl GenerationHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(COUNTS_MAGIC);
        out[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        out[8..16].copy_from_slice(&self.transaction_id.0.to_le_bytes());
        out[16..20].copy_from_slice(&self.entry_count.to_le_bytes());
        out[24..32].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("truncated header ({} bytes)", bytes.len()));
        }
        if &bytes[0..4] != COUNTS_MAGIC {
            return Err("invalid magic".into());
        }
        if bytes[20..24] != [0u8; 4] {
            return Err("reserved header bytes are not zero".into());
        }

        let format_version = u32::from_le_bytes(array(&bytes[4..8]));
        if format_version != COUNTS_FORMAT_VERSION {
            return Err(format!("unsupported format version {}", format_version));
        }

        Ok(Self {
            format_version,
            transaction_id: TransactionId(u64::from_le_bytes(array(&bytes[8..16]))),
            entry_count: u32::from_le_bytes(array(&bytes[16..20])),
            checksum: u64::from_le_bytes(array(&bytes[24..32])),
        })
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn checksum(format_version: u32, transaction_id: TransactionId, entry_count: u32, body: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(format_version.to_le_bytes());
    hasher.update(transaction_id.0.to_le_bytes());
    hasher.update(entry_count.to_le_bytes());
    hasher.update(body);
    let digest = hasher.finalize();
    u64::from_le_bytes(array(&digest[0..8]))
}

fn encode_body(table: &CounterTable) -> Vec<u8> {
    let mut body = Vec::with_capacity(table.len() * ENTRY_SIZE);
    for (key, count) in table.snapshot() {
        body.extend_from_slice(&key.encode());
        body.extend_from_slice(&count.to_le_bytes());
    }
    body
}

fn decode_body(body: &[u8]) -> std::result::Result<CounterTable, String> {
    let mut entries = Vec::with_capacity(body.len() / ENTRY_SIZE);
    for chunk in body.chunks_exact(ENTRY_SIZE) {
        let key = CounterKey::decode(&array(&chunk[..KEY_SIZE]))
            .ok_or_else(|| format!("unknown counter key {}", hex::encode(&chunk[..KEY_SIZE])))?;
        let count = i64::from_le_bytes(array(&chunk[KEY_SIZE..]));
        entries.push((key, count));
    }
    CounterTable::from_entries(entries).map_err(|e| e.to_string())
}

/// A valid generation read back from disk.
#[derive(Clone, Debug)]
pub struct LoadedGeneration {
    pub generation: Generation,
    pub transaction_id: TransactionId,
    pub table: CounterTable,
}

/// The `A`/`B` pair of counts store files.
pub struct DualGenerationStore {
    medium: Arc<dyn StorageMedium>,
    path_a: PathBuf,
    path_b: PathBuf,
    /// Generation selected by the last open or write, with its stamp.
    active: Option<(Generation, TransactionId)>,
}

impl fmt::Debug for DualGenerationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualGenerationStore")
            .field("path_a", &self.path_a)
            .field("path_b", &self.path_b)
            .field("active", &self.active)
            .finish()
    }
}

impl DualGenerationStore {
    /// Open the standard pair of files inside a database directory.
    pub fn open_in(
        medium: Arc<dyn StorageMedium>,
        dir: impl AsRef<Path>,
    ) -> (Self, Option<LoadedGeneration>) {
        let dir = dir.as_ref();
        Self::open(medium, dir.join(COUNTS_STORE_A), dir.join(COUNTS_STORE_B))
    }

    /// Read both generations and select the current one.
    ///
    /// Missing, truncated or corrupt generations are ignored. Returns `None`
    /// when neither generation is valid, in which case the caller must
    /// rebuild.
    pub fn open(
        medium: Arc<dyn StorageMedium>,
        path_a: impl Into<PathBuf>,
        path_b: impl Into<PathBuf>,
    ) -> (Self, Option<LoadedGeneration>) {
        let mut store = Self {
            medium,
            path_a: path_a.into(),
            path_b: path_b.into(),
            active: None,
        };

        let a = store.read_valid(Generation::A);
        let b = store.read_valid(Generation::B);

        let current = match (a, b) {
            (Some(a), Some(b)) => {
                if b.transaction_id > a.transaction_id {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (a, b) => a.or(b),
        };

        if let Some(loaded) = &current {
            debug!(
                generation = %loaded.generation,
                transaction_id = loaded.transaction_id.0,
                entries = loaded.table.len(),
                "Selected counts store generation"
            );
            store.active = Some((loaded.generation, loaded.transaction_id));
        }

        (store, current)
    }

    fn read_valid(&self, generation: Generation) -> Option<LoadedGeneration> {
        match self.read_generation(generation) {
            Ok(Some(loaded)) => Some(loaded),
            Ok(None) => {
                debug!(generation = %generation, "Counts store generation is missing");
                None
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Read and validate one generation. `Ok(None)` when the file is absent.
    pub fn read_generation(&self, generation: Generation) -> Result<Option<LoadedGeneration>> {
        let path = self.path(generation);
        let corrupt = |reason: String| CountsError::CorruptGeneration { generation, reason };

        let bytes = match self.medium.read_file(path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => return Err(corrupt(format!("unreadable: {}", e))),
        };

        let header = GenerationHeader::decode(&bytes).map_err(corrupt)?;
        let body = &bytes[HEADER_SIZE..];

        let expected_len = header.entry_count as usize * ENTRY_SIZE;
        if body.len() != expected_len {
            return Err(corrupt(format!(
                "expected {} body bytes for {} entries, found {}",
                expected_len,
                header.entry_count,
                body.len()
            )));
        }

        let computed = checksum(header.format_version, header.transaction_id, header.entry_count, body);
        if computed != header.checksum {
            return Err(corrupt(
                CountsError::ChecksumMismatch {
                    expected: hex::encode(header.checksum.to_le_bytes()),
                    got: hex::encode(computed.to_le_bytes()),
                }
                .to_string(),
            ));
        }

        let table = decode_body(body).map_err(corrupt)?;

        Ok(Some(LoadedGeneration {
            generation,
            transaction_id: header.transaction_id,
            table,
        }))
    }

    /// Persist `table` as of `transaction_id` into the inactive generation
    /// and make it active.
    ///
    /// The target header is cleared first, then the body is written and
    /// fsynced, then the header is written and fsynced. Until that final
    /// fsync the target is invalid and the previous generation stays current.
    pub fn write(&mut self, table: &CounterTable, transaction_id: TransactionId) -> Result<()> {
        if let Some((generation, active_tx)) = self.active {
            if transaction_id < active_tx {
                return Err(CountsError::InvalidOperation(format!(
                    "cannot write counts at transaction {} behind generation {} at {}",
                    transaction_id, generation, active_tx
                )));
            }
        }

        let target = self.inactive_generation();
        let path = self.path(target).to_path_buf();

        let entry_count = u32::try_from(table.len()).map_err(|_| {
            CountsError::InvalidOperation(format!("too many counters: {}", table.len()))
        })?;
        let body = encode_body(table);
        let header = GenerationHeader {
            transaction_id,
            format_version: COUNTS_FORMAT_VERSION,
            entry_count,
            checksum: checksum(COUNTS_FORMAT_VERSION, transaction_id, entry_count, &body),
        };

        self.medium.write_at(&path, 0, &[0u8; HEADER_SIZE])?;
        self.medium.fsync(&path)?;

        self.medium.truncate(&path, (HEADER_SIZE + body.len()) as u64)?;
        self.medium.write_at(&path, HEADER_SIZE as u64, &body)?;
        self.medium.fsync(&path)?;

        self.medium.write_at(&path, 0, &header.encode())?;
        self.medium.fsync(&path)?;

        debug!(
            generation = %target,
            transaction_id = transaction_id.0,
            entries = entry_count,
            "Wrote counts store generation"
        );

        self.active = Some((target, transaction_id));
        Ok(())
    }

    /// Delete both generations. The next write goes to `A`.
    pub fn discard(&mut self) -> Result<()> {
        for generation in [Generation::A, Generation::B] {
            let path = self.path(generation).to_path_buf();
            if self.medium.delete(&path)? {
                debug!(generation = %generation, "Discarded counts store generation");
            }
        }
        self.active = None;
        Ok(())
    }

    /// The generation the next write will go to.
    pub fn inactive_generation(&self) -> Generation {
        match self.active {
            Some((generation, _)) => generation.other(),
            None => Generation::A,
        }
    }

    pub fn active_generation(&self) -> Option<Generation> {
        self.active.map(|(generation, _)| generation)
    }

    /// Transaction id of the active generation.
    pub fn active_transaction_id(&self) -> Option<TransactionId> {
        self.active.map(|(_, tx)| tx)
    }

    pub fn path(&self, generation: Generation) -> &Path {
        match generation {
            Generation::A => &self.path_a,
            Generation::B => &self.path_b,
        }
    }
}
