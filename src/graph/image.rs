//! Checkpoint image of the graph store.

use super::store::GraphStore;
use crate::error::{CountsError, Result};
use crate::io::StorageMedium;
use crate::types::TransactionId;
use std::path::Path;

/// File name of the graph image inside a database directory.
pub const GRAPH_STORE_FILE: &str = "neostore.graph.db";

/// Magic bytes for the graph image.
const GRAPH_MAGIC: &[u8; 4] = b"GRF\0";

/// Current graph image format version.
const GRAPH_VERSION: u8 = 1;

/// magic + version + transaction id + body length
const PREFIX_SIZE: usize = 4 + 1 + 8 + 8;

/// Write the graph as of `transaction_id`, replacing any previous image.
pub fn write_image(
    medium: &dyn StorageMedium,
    path: &Path,
    transaction_id: TransactionId,
    graph: &GraphStore,
) -> Result<()> {
    let body = rmp_serde::to_vec(graph)?;

    let mut bytes = Vec::with_capacity(PREFIX_SIZE + body.len() + 4);
    bytes.extend_from_slice(GRAPH_MAGIC);
    bytes.push(GRAPH_VERSION);
    bytes.extend_from_slice(&transaction_id.0.to_le_bytes());
    bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());

    medium.replace_file(path, &bytes)
}

/// Load the graph image, or `None` when the database has never been
/// checkpointed.
pub fn read_image(medium: &dyn StorageMedium, path: &Path) -> Result<Option<(TransactionId, GraphStore)>> {
    let bytes = match medium.read_file(path)? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };

    if bytes.len() < PREFIX_SIZE + 4 {
        return Err(CountsError::Corruption("graph image truncated".into()));
    }
    if &bytes[0..4] != GRAPH_MAGIC {
        return Err(CountsError::InvalidFormat("Invalid graph image magic".into()));
    }
    if bytes[4] != GRAPH_VERSION {
        return Err(CountsError::InvalidFormat(format!(
            "Unsupported graph image version: {}",
            bytes[4]
        )));
    }

    let mut tx_bytes = [0u8; 8];
    tx_bytes.copy_from_slice(&bytes[5..13]);
    let transaction_id = TransactionId(u64::from_le_bytes(tx_bytes));

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[13..21]);
    let len = u64::from_le_bytes(len_bytes);

    // Compared against the file size, never added to
    let len = match usize::try_from(len) {
        Ok(len) if len == bytes.len() - PREFIX_SIZE - 4 => len,
        _ => {
            return Err(CountsError::Corruption(format!(
                "graph image length mismatch: body claims {} bytes, file has {}",
                len,
                bytes.len()
            )))
        }
    };

    let body = &bytes[PREFIX_SIZE..PREFIX_SIZE + len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&bytes[PREFIX_SIZE + len..]);
    if u32::from_le_bytes(crc_bytes) != crc32fast::hash(body) {
        return Err(CountsError::Corruption("graph image checksum mismatch".into()));
    }

    let graph = rmp_serde::from_slice(body)?;
    Ok(Some((transaction_id, graph)))
}
