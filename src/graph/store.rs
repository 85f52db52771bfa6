//! In-memory primary graph store.

use super::tokens::TokenRegistry;
use crate::counts::{CounterKey, DeltaBatch, NodeEntry, NodeSource, RelationshipEntry, RelationshipSource};
use crate::error::{CountsError, Result};
use crate::types::{NodeId, RelationshipId, TokenId};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Which registry a token belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Label,
    RelationshipType,
}

/// A single change made by a transaction. Logged verbatim to the
/// transaction log and replayed on recovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphOperation {
    CreateToken {
        kind: TokenKind,
        id: TokenId,
        name: String,
    },
    CreateNode {
        id: NodeId,
        labels: Vec<TokenId>,
    },
    DeleteNode {
        id: NodeId,
    },
    AddLabel {
        node: NodeId,
        label: TokenId,
    },
    RemoveLabel {
        node: NodeId,
        label: TokenId,
    },
    CreateRelationship {
        id: RelationshipId,
        rel_type: TokenId,
        start: NodeId,
        end: NodeId,
    },
    DeleteRelationship {
        id: RelationshipId,
    },
}

/// Stored node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub labels: BTreeSet<TokenId>,
    /// Number of relationship endpoints attached to this node.
    pub degree: u32,
}

/// Stored relationship.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub rel_type: TokenId,
    pub start: NodeId,
    pub end: NodeId,
}

/// Read/write access shared by the store itself and by a transaction's
/// validation overlay, so both go through the same rules.
trait GraphState {
    fn node(&self, id: NodeId) -> Option<NodeRecord>;
    fn set_node(&mut self, id: NodeId, record: Option<NodeRecord>);
    fn relationship(&self, id: RelationshipId) -> Option<RelationshipRecord>;
    fn set_relationship(&mut self, id: RelationshipId, record: Option<RelationshipRecord>);
    fn tokens(&self, kind: TokenKind) -> &TokenRegistry;
    fn tokens_mut(&mut self, kind: TokenKind) -> &mut TokenRegistry;
}

/// Nodes, relationships and their tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStore {
    labels: TokenRegistry,
    relationship_types: TokenRegistry,
    nodes: BTreeMap<NodeId, NodeRecord>,
    relationships: BTreeMap<RelationshipId, RelationshipRecord>,
    /// One past the highest node id ever created.
    next_node_id: u64,
    /// One past the highest relationship id ever created.
    next_relationship_id: u64,
}

impl GraphState for GraphStore {
    fn node(&self, id: NodeId) -> Option<NodeRecord> {
        self.nodes.get(&id).cloned()
    }

    fn set_node(&mut self, id: NodeId, record: Option<NodeRecord>) {
        match record {
            Some(record) => {
                self.next_node_id = self.next_node_id.max(id.0 + 1);
                self.nodes.insert(id, record);
            }
            None => {
                self.nodes.remove(&id);
            }
        }
    }

    fn relationship(&self, id: RelationshipId) -> Option<RelationshipRecord> {
        self.relationships.get(&id).copied()
    }

    fn set_relationship(&mut self, id: RelationshipId, record: Option<RelationshipRecord>) {
        match record {
            Some(record) => {
                self.next_relationship_id = self.next_relationship_id.max(id.0 + 1);
                self.relationships.insert(id, record);
            }
            None => {
                self.relationships.remove(&id);
            }
        }
    }

    fn tokens(&self, kind: TokenKind) -> &TokenRegistry {
        match kind {
            TokenKind::Label => &self.labels,
            TokenKind::RelationshipType => &self.relationship_types,
        }
    }

    fn tokens_mut(&mut self, kind: TokenKind) -> &mut TokenRegistry {
        match kind {
            TokenKind::Label => &mut self.labels,
            TokenKind::RelationshipType => &mut self.relationship_types,
        }
    }
}

/// Uncommitted view: the store plus a transaction's earlier operations.
struct Overlay<'a> {
    base: &'a GraphStore,
    nodes: HashMap<NodeId, Option<NodeRecord>>,
    relationships: HashMap<RelationshipId, Option<RelationshipRecord>>,
    labels: Cow<'a, TokenRegistry>,
    relationship_types: Cow<'a, TokenRegistry>,
}

impl<'a> Overlay<'a> {
    fn new(base: &'a GraphStore) -> Self {
        Self {
            base,
            nodes: HashMap::new(),
            relationships: HashMap::new(),
            labels: Cow::Borrowed(&base.labels),
            relationship_types: Cow::Borrowed(&base.relationship_types),
        }
    }
}

impl GraphState for Overlay<'_> {
    fn node(&self, id: NodeId) -> Option<NodeRecord> {
        match self.nodes.get(&id) {
            Some(staged) => staged.clone(),
            None => self.base.node(id).cloned(),
        }
    }

    fn set_node(&mut self, id: NodeId, record: Option<NodeRecord>) {
        self.nodes.insert(id, record);
    }

    fn relationship(&self, id: RelationshipId) -> Option<RelationshipRecord> {
        match self.relationships.get(&id) {
            Some(staged) => *staged,
            None => self.base.relationship(id).copied(),
        }
    }

    fn set_relationship(&mut self, id: RelationshipId, record: Option<RelationshipRecord>) {
        self.relationships.insert(id, record);
    }

    fn tokens(&self, kind: TokenKind) -> &TokenRegistry {
        match kind {
            TokenKind::Label => &*self.labels,
            TokenKind::RelationshipType => &*self.relationship_types,
        }
    }

    fn tokens_mut(&mut self, kind: TokenKind) -> &mut TokenRegistry {
        match kind {
            TokenKind::Label => self.labels.to_mut(),
            TokenKind::RelationshipType => self.relationship_types.to_mut(),
        }
    }
}

fn require_token(state: &impl GraphState, kind: TokenKind, id: TokenId) -> Result<()> {
    if state.tokens(kind).contains(id) {
        Ok(())
    } else {
        Err(CountsError::TokenNotFound(format!("{:?} {}", kind, id)))
    }
}

fn require_node(state: &impl GraphState, id: NodeId) -> Result<NodeRecord> {
    state.node(id).ok_or(CountsError::NodeNotFound(id))
}

/// Apply one operation to `state`, recording its count changes in `batch`.
fn step(state: &mut impl GraphState, op: &GraphOperation, batch: &mut DeltaBatch) -> Result<()> {
    match op {
        GraphOperation::CreateToken { kind, id, name } => {
            state
                .tokens_mut(*kind)
                .insert(*id, name)
                .map_err(CountsError::InvalidOperation)?;
        }
        GraphOperation::CreateNode { id, labels } => {
            if state.node(*id).is_some() {
                return Err(CountsError::InvalidOperation(format!("node {} already exists", id)));
            }
            let mut record = NodeRecord::default();
            for label in labels {
                require_token(&*state, TokenKind::Label, *label)?;
                if record.labels.insert(*label) {
                    batch.increment(CounterKey::label(*label));
                }
            }
            batch.increment(CounterKey::nodes());
            state.set_node(*id, Some(record));
        }
        GraphOperation::DeleteNode { id } => {
            let record = require_node(&*state, *id)?;
            if record.degree > 0 {
                return Err(CountsError::InvalidOperation(format!(
                    "node {} still has {} relationship endpoints",
                    id, record.degree
                )));
            }
            for label in &record.labels {
                batch.decrement(CounterKey::label(*label));
            }
            batch.decrement(CounterKey::nodes());
            state.set_node(*id, None);
        }
        GraphOperation::AddLabel { node, label } => {
            require_token(&*state, TokenKind::Label, *label)?;
            let mut record = require_node(&*state, *node)?;
            if record.labels.insert(*label) {
                batch.increment(CounterKey::label(*label));
                state.set_node(*node, Some(record));
            }
        }
        GraphOperation::RemoveLabel { node, label } => {
            let mut record = require_node(&*state, *node)?;
            if record.labels.remove(label) {
                batch.decrement(CounterKey::label(*label));
                state.set_node(*node, Some(record));
            }
        }
        GraphOperation::CreateRelationship {
            id,
            rel_type,
            start,
            end,
        } => {
            if state.relationship(*id).is_some() {
                return Err(CountsError::InvalidOperation(format!(
                    "relationship {} already exists",
                    id
                )));
            }
            require_token(&*state, TokenKind::RelationshipType, *rel_type)?;
            for endpoint in [*start, *end] {
                let mut record = require_node(&*state, endpoint)?;
                record.degree += 1;
                state.set_node(endpoint, Some(record));
            }
            batch
                .increment(CounterKey::relationships())
                .increment(CounterKey::relationship_type(*rel_type));
            state.set_relationship(
                *id,
                Some(RelationshipRecord {
                    rel_type: *rel_type,
                    start: *start,
                    end: *end,
                }),
            );
        }
        GraphOperation::DeleteRelationship { id } => {
            let record = state
                .relationship(*id)
                .ok_or(CountsError::RelationshipNotFound(*id))?;
            for endpoint in [record.start, record.end] {
                let mut node = require_node(&*state, endpoint)?;
                node.degree = node.degree.saturating_sub(1);
                state.set_node(endpoint, Some(node));
            }
            batch
                .decrement(CounterKey::relationships())
                .decrement(CounterKey::relationship_type(record.rel_type));
            state.set_relationship(*id, None);
        }
    }
    Ok(())
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a transaction's operations against the current state and
    /// derive its count changes, without modifying the store.
    pub fn prepare(&self, ops: &[GraphOperation]) -> Result<DeltaBatch> {
        let mut overlay = Overlay::new(self);
        let mut batch = DeltaBatch::new();
        for op in ops {
            step(&mut overlay, op, &mut batch)?;
        }
        Ok(batch)
    }

    /// Apply a transaction's operations. Callers validate with
    /// [`GraphStore::prepare`] first; an error here leaves the store
    /// partially updated.
    pub fn apply(&mut self, ops: &[GraphOperation]) -> Result<DeltaBatch> {
        let mut batch = DeltaBatch::new();
        for op in ops {
            step(self, op, &mut batch)?;
        }
        Ok(batch)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&id)
    }

    pub fn relationship(&self, id: RelationshipId) -> Option<&RelationshipRecord> {
        self.relationships.get(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn nodes_with_label(&self, label: TokenId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.labels.contains(&label))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn labels(&self) -> &TokenRegistry {
        &self.labels
    }

    pub fn relationship_types(&self) -> &TokenRegistry {
        &self.relationship_types
    }

    pub fn next_node_id(&self) -> NodeId {
        NodeId(self.next_node_id)
    }

    pub fn next_relationship_id(&self) -> RelationshipId {
        RelationshipId(self.next_relationship_id)
    }
}

impl NodeSource for GraphStore {
    fn enumerate_nodes(&self) -> Box<dyn Iterator<Item = Result<NodeEntry>> + '_> {
        Box::new(self.nodes.iter().map(|(id, node)| {
            Ok(NodeEntry {
                id: *id,
                labels: node.labels.iter().copied().collect(),
            })
        }))
    }
}

impl RelationshipSource for GraphStore {
    fn enumerate_relationships(&self) -> Box<dyn Iterator<Item = Result<RelationshipEntry>> + '_> {
        Box::new(self.relationships.iter().map(|(id, rel)| {
            Ok(RelationshipEntry {
                id: *id,
                rel_type: rel.rel_type,
            })
        }))
    }
}
