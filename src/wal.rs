//! Transaction log.
//!
//! Every committed transaction is appended and fsynced here before it is
//! applied to the graph and the counts store. On startup the log is
//! replayed past the last checkpoint; after a checkpoint, segments that
//! only hold checkpointed transactions are reclaimed.
//!
//! The log is a sequence of segment files `txlog.<n>`. Each segment starts
//! with a 5 byte header (magic + version) followed by frames of
//! `len (u32 LE) | rmp-serde entry | crc32 (u32 LE)`.

use crate::error::{CountsError, Result};
use crate::graph::GraphOperation;
use crate::io::StorageMedium;
use crate::types::{Timestamp, TransactionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix of segment file names.
pub const LOG_FILE_PREFIX: &str = "txlog.";

/// Magic bytes for log segments.
const LOG_MAGIC: &[u8; 4] = b"TXL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

const LOG_HEADER_SIZE: usize = 5;

/// 100MB sanity limit on a single frame.
const MAX_ENTRY_SIZE: usize = 100 * 1024 * 1024;

/// One committed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub transaction_id: TransactionId,
    pub timestamp: Timestamp,
    pub operations: Vec<GraphOperation>,
}

impl WalEntry {
    pub fn new(transaction_id: TransactionId, operations: Vec<GraphOperation>) -> Self {
        Self {
            transaction_id,
            timestamp: Timestamp::now(),
            operations,
        }
    }
}

#[derive(Clone, Debug)]
struct Segment {
    number: u64,
    path: PathBuf,
    /// Highest transaction in this segment, if it has any.
    last_tx: Option<TransactionId>,
}

#[derive(Debug)]
struct LogState {
    /// Ordered by number; the last one is written to.
    segments: Vec<Segment>,
    write_offset: u64,
    last_committed: TransactionId,
}

/// Result of parsing one segment.
struct ParsedSegment {
    entries: Vec<WalEntry>,
    /// Length of the valid prefix.
    valid_len: usize,
    /// Why parsing stopped before the end of the file, if it did.
    torn: Option<String>,
}

fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{}{:010}", LOG_FILE_PREFIX, number))
}

fn segment_number(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(LOG_FILE_PREFIX)?
        .parse()
        .ok()
}

fn encode_frame(entry: &WalEntry) -> Result<Vec<u8>> {
    let encoded = rmp_serde::to_vec(entry)?;
    let mut frame = Vec::with_capacity(encoded.len() + 8);
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);
    frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
    Ok(frame)
}

/// Decode the frame at the start of `bytes`, returning it with its length.
fn decode_frame(bytes: &[u8]) -> std::result::Result<(WalEntry, usize), String> {
    if bytes.len() < 4 {
        return Err("incomplete frame length".into());
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&bytes[..4]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_ENTRY_SIZE {
        return Err(format!("frame of {} bytes is too large", len));
    }

    let end = 4 + len + 4;
    if bytes.len() < end {
        return Err("incomplete frame".into());
    }
    let encoded = &bytes[4..4 + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&bytes[4 + len..end]);
    if u32::from_le_bytes(crc_bytes) != crc32fast::hash(encoded) {
        return Err("frame checksum mismatch".into());
    }

    let entry = rmp_serde::from_slice(encoded).map_err(|e| e.to_string())?;
    Ok((entry, end))
}

fn parse_segment(path: &Path, bytes: &[u8]) -> Result<ParsedSegment> {
    if bytes.len() < LOG_HEADER_SIZE {
        return Ok(ParsedSegment {
            entries: Vec::new(),
            valid_len: 0,
            torn: Some("incomplete segment header".into()),
        });
    }
    if &bytes[0..4] != LOG_MAGIC {
        return Err(CountsError::InvalidFormat(format!(
            "Invalid log magic in {}",
            path.display()
        )));
    }
    if bytes[4] != LOG_VERSION {
        return Err(CountsError::InvalidFormat(format!(
            "Unsupported log version: {}",
            bytes[4]
        )));
    }

    let mut entries = Vec::new();
    let mut offset = LOG_HEADER_SIZE;
    let mut torn = None;
    while offset < bytes.len() {
        match decode_frame(&bytes[offset..]) {
            Ok((entry, len)) => {
                entries.push(entry);
                offset += len;
            }
            Err(reason) => {
                torn = Some(reason);
                break;
            }
        }
    }

    Ok(ParsedSegment {
        entries,
        valid_len: offset,
        torn,
    })
}

/// Append-only, segmented log of committed transactions.
pub struct TransactionLog {
    medium: Arc<dyn StorageMedium>,
    dir: PathBuf,
    state: Mutex<LogState>,
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("dir", &self.dir)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl TransactionLog {
    /// Open the log in `dir`, creating the first segment if there is none.
    ///
    /// `base` is the transaction the last checkpoint reflects; the last
    /// committed id is the higher of `base` and the newest logged entry.
    /// A torn frame at the end of the newest segment is cut off.
    pub fn open(medium: Arc<dyn StorageMedium>, dir: impl AsRef<Path>, base: TransactionId) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        let mut numbered: Vec<(u64, PathBuf)> = medium
            .list(&dir)?
            .into_iter()
            .filter_map(|path| segment_number(&path).map(|n| (n, path)))
            .collect();
        numbered.sort_by_key(|(n, _)| *n);

        let mut segments = Vec::with_capacity(numbered.len().max(1));
        let mut previous: Option<TransactionId> = None;
        let mut write_offset = LOG_HEADER_SIZE as u64;
        let count = numbered.len();

        for (i, (number, path)) in numbered.into_iter().enumerate() {
            let is_last = i + 1 == count;
            let bytes = medium.read_file(&path)?.unwrap_or_default();
            let parsed = parse_segment(&path, &bytes)?;

            if let Some(reason) = &parsed.torn {
                if !is_last {
                    return Err(CountsError::Corruption(format!(
                        "{} in sealed log segment {}",
                        reason,
                        path.display()
                    )));
                }
                warn!(
                    segment = %path.display(),
                    valid_len = parsed.valid_len,
                    "Discarding torn log tail: {}",
                    reason
                );
                if parsed.valid_len < LOG_HEADER_SIZE {
                    write_header(medium.as_ref(), &path)?;
                } else {
                    medium.truncate(&path, parsed.valid_len as u64)?;
                    medium.fsync(&path)?;
                }
            }

            for entry in &parsed.entries {
                if let Some(prev) = previous {
                    if entry.transaction_id != prev.next() {
                        return Err(CountsError::Corruption(format!(
                            "log entry {} follows {} in {}",
                            entry.transaction_id,
                            prev,
                            path.display()
                        )));
                    }
                }
                previous = Some(entry.transaction_id);
            }

            if is_last {
                write_offset = parsed.valid_len.max(LOG_HEADER_SIZE) as u64;
            }
            segments.push(Segment {
                number,
                path,
                last_tx: parsed.entries.last().map(|e| e.transaction_id),
            });
        }

        if segments.is_empty() {
            let path = segment_path(&dir, 0);
            write_header(medium.as_ref(), &path)?;
            segments.push(Segment {
                number: 0,
                path,
                last_tx: None,
            });
        }

        let last_committed = previous.map_or(base, |tx| tx.max(base));
        debug!(
            segments = segments.len(),
            last_committed = last_committed.0,
            "Opened transaction log"
        );

        Ok(Self {
            medium,
            dir,
            state: Mutex::new(LogState {
                segments,
                write_offset,
                last_committed,
            }),
        })
    }

    /// Append and fsync one transaction. Its id must directly follow the
    /// last committed one.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let mut state = self.state.lock();
        let expected = state.last_committed.next();
        if entry.transaction_id != expected {
            return Err(CountsError::OutOfOrderCommit {
                last: state.last_committed,
                got: entry.transaction_id,
            });
        }

        let frame = encode_frame(entry)?;
        let offset = state.write_offset;
        let segment = state
            .segments
            .last_mut()
            .ok_or_else(|| CountsError::Corruption("transaction log has no segments".into()))?;

        let written = self
            .medium
            .write_at(&segment.path, offset, &frame)
            .and_then(|_| self.medium.fsync(&segment.path));
        if let Err(e) = written {
            // Best effort; a leftover partial frame is cut off on next open
            let _ = self.medium.truncate(&segment.path, offset);
            return Err(e);
        }

        segment.last_tx = Some(entry.transaction_id);
        state.write_offset = offset + frame.len() as u64;
        state.last_committed = entry.transaction_id;
        Ok(())
    }

    /// Feed every entry with an id greater than `after` to `apply`, in
    /// commit order. Returns the id of the last entry applied, or `after`
    /// when there was nothing to replay.
    pub fn replay<F>(&self, after: TransactionId, mut apply: F) -> Result<TransactionId>
    where
        F: FnMut(WalEntry) -> Result<()>,
    {
        let paths: Vec<PathBuf> = self
            .state
            .lock()
            .segments
            .iter()
            .filter(|s| s.last_tx.map_or(false, |tx| tx > after))
            .map(|s| s.path.clone())
            .collect();

        let mut last = after;
        let mut replayed = 0usize;
        for path in paths {
            let bytes = self.medium.read_file(&path)?.unwrap_or_default();
            let parsed = parse_segment(&path, &bytes)?;
            for entry in parsed.entries {
                if entry.transaction_id <= last {
                    continue;
                }
                if entry.transaction_id != last.next() {
                    return Err(CountsError::Corruption(format!(
                        "transaction log is missing transactions {} to {}",
                        last.next(),
                        entry.transaction_id.0 - 1
                    )));
                }
                last = entry.transaction_id;
                apply(entry)?;
                replayed += 1;
            }
        }

        if replayed > 0 {
            debug!(after = after.0, last = last.0, replayed, "Replayed transaction log");
        }
        Ok(last)
    }

    /// Seal the current segment and start a new one. Does nothing when the
    /// current segment is still empty.
    pub fn rotate(&self) -> Result<()> {
        let mut state = self.state.lock();
        let (number, empty) = match state.segments.last() {
            Some(current) => (current.number + 1, current.last_tx.is_none()),
            None => (0, true),
        };
        if empty && !state.segments.is_empty() {
            return Ok(());
        }

        let path = segment_path(&self.dir, number);
        write_header(self.medium.as_ref(), &path)?;
        state.segments.push(Segment {
            number,
            path,
            last_tx: None,
        });
        state.write_offset = LOG_HEADER_SIZE as u64;
        Ok(())
    }

    /// Delete sealed segments holding nothing newer than `through`.
    /// Returns how many were deleted.
    pub fn prune_through(&self, through: TransactionId) -> Result<usize> {
        let mut state = self.state.lock();
        let mut pruned = 0;
        while state.segments.len() > 1 {
            let reclaimable = state.segments[0].last_tx.map_or(true, |tx| tx <= through);
            if !reclaimable {
                break;
            }
            let segment = state.segments.remove(0);
            self.medium.delete(&segment.path)?;
            pruned += 1;
        }
        if pruned > 0 {
            debug!(through = through.0, pruned, "Pruned transaction log segments");
        }
        Ok(pruned)
    }

    pub fn last_committed_transaction_id(&self) -> TransactionId {
        self.state.lock().last_committed
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }
}

fn write_header(medium: &dyn StorageMedium, path: &Path) -> Result<()> {
    let mut header = [0u8; LOG_HEADER_SIZE];
    header[..4].copy_from_slice(LOG_MAGIC);
    header[4] = LOG_VERSION;
    medium.truncate(path, 0)?;
    medium.write_at(path, 0, &header)?;
    medium.fsync(path)
}
