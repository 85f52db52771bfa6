//! Full-scan rebuild of the counter table.

use super::key::CounterKey;
use super::table::CounterTable;
use crate::error::{CountsError, Result};
use crate::types::{NodeId, RelationshipId, TokenId, TransactionId};
use tracing::{error, info, warn};

/// Logged before a rebuild starts.
pub const REBUILD_STARTED: &str = "Missing counts store, rebuilding it.";

/// Logged once a rebuild has finished.
pub const REBUILD_COMPLETED: &str = "Counts store rebuild completed.";

/// A live node as seen by a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub labels: Vec<TokenId>,
}

/// A live relationship as seen by a scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelationshipEntry {
    pub id: RelationshipId,
    pub rel_type: TokenId,
}

/// Enumerates every live node of the primary store.
pub trait NodeSource {
    fn enumerate_nodes(&self) -> Box<dyn Iterator<Item = Result<NodeEntry>> + '_>;
}

/// Enumerates every live relationship of the primary store.
pub trait RelationshipSource {
    fn enumerate_relationships(&self) -> Box<dyn Iterator<Item = Result<RelationshipEntry>> + '_>;
}

/// Recompute counts from a full scan of the primary stores.
///
/// The table is returned only once both scans completed; any scan error is
/// reported as [`CountsError::RebuildFailure`].
pub fn rebuild(
    nodes: &dyn NodeSource,
    relationships: &dyn RelationshipSource,
    as_of: TransactionId,
) -> Result<CounterTable> {
    warn!("{}", REBUILD_STARTED);

    match scan(nodes, relationships) {
        Ok(table) => {
            info!(
                transaction_id = as_of.0,
                nodes = table.read(CounterKey::nodes()),
                relationships = table.read(CounterKey::relationships()),
                "Rebuilt counts"
            );
            warn!("{}", REBUILD_COMPLETED);
            Ok(table)
        }
        Err(e) => {
            error!(transaction_id = as_of.0, "Counts store rebuild failed: {}", e);
            Err(CountsError::rebuild_failure(e))
        }
    }
}

fn scan(nodes: &dyn NodeSource, relationships: &dyn RelationshipSource) -> Result<CounterTable> {
    let mut table = CounterTable::new();

    for node in nodes.enumerate_nodes() {
        let node = node?;
        table.increment(CounterKey::nodes());
        for label in node.labels {
            table.increment(CounterKey::label(label));
        }
    }

    for relationship in relationships.enumerate_relationships() {
        let relationship = relationship?;
        table.increment(CounterKey::relationships());
        table.increment(CounterKey::relationship_type(relationship.rel_type));
    }

    Ok(table)
}
