//! Counter keys and their fixed-width on-disk encoding.

use crate::types::{EntityKind, TokenId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded size of a key: tag byte + token id.
pub const KEY_SIZE: usize = 1 + 4;

const TAG_NODE_TOTAL: u8 = 0;
const TAG_RELATIONSHIP_TOTAL: u8 = 1;
const TAG_NODE_LABEL: u8 = 2;
const TAG_RELATIONSHIP_TYPE: u8 = 3;

/// Key of a single counter.
///
/// The derived ordering puts all totals before token counters, which gives
/// snapshots a stable serialization order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CounterKey {
    /// Number of live entities of a kind.
    Total(EntityKind),
    /// Number of live entities of a kind carrying a label or type.
    ByToken(EntityKind, TokenId),
}

impl CounterKey {
    pub fn nodes() -> Self {
        CounterKey::Total(EntityKind::Node)
    }

    pub fn relationships() -> Self {
        CounterKey::Total(EntityKind::Relationship)
    }

    pub fn label(label: TokenId) -> Self {
        CounterKey::ByToken(EntityKind::Node, label)
    }

    pub fn relationship_type(rel_type: TokenId) -> Self {
        CounterKey::ByToken(EntityKind::Relationship, rel_type)
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            CounterKey::Total(kind) | CounterKey::ByToken(kind, _) => *kind,
        }
    }

    /// Encode into the fixed-width on-disk form.
    pub fn encode(&self) -> [u8; KEY_SIZE] {
        let (tag, token) = match self {
            CounterKey::Total(EntityKind::Node) => (TAG_NODE_TOTAL, 0),
            CounterKey::Total(EntityKind::Relationship) => (TAG_RELATIONSHIP_TOTAL, 0),
            CounterKey::ByToken(EntityKind::Node, t) => (TAG_NODE_LABEL, t.0),
            CounterKey::ByToken(EntityKind::Relationship, t) => (TAG_RELATIONSHIP_TYPE, t.0),
        };
        let mut out = [0u8; KEY_SIZE];
        out[0] = tag;
        out[1..].copy_from_slice(&token.to_le_bytes());
        out
    }

    /// Decode a key, returning `None` for an unknown tag or a non-zero token
    /// on a total.
    pub fn decode(bytes: &[u8; KEY_SIZE]) -> Option<Self> {
        let mut token_bytes = [0u8; 4];
        token_bytes.copy_from_slice(&bytes[1..]);
        let token = u32::from_le_bytes(token_bytes);
        match (bytes[0], token) {
            (TAG_NODE_TOTAL, 0) => Some(CounterKey::Total(EntityKind::Node)),
            (TAG_RELATIONSHIP_TOTAL, 0) => Some(CounterKey::Total(EntityKind::Relationship)),
            (TAG_NODE_LABEL, t) => Some(CounterKey::ByToken(EntityKind::Node, TokenId(t))),
            (TAG_RELATIONSHIP_TYPE, t) => {
                Some(CounterKey::ByToken(EntityKind::Relationship, TokenId(t)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKey::Total(kind) => write!(f, "{}s(*)", kind),
            CounterKey::ByToken(kind, token) => write!(f, "{}s({})", kind, token),
        }
    }
}
