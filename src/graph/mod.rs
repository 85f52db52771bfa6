//! Primary graph storage: nodes, relationships and their tokens.
//!
//! The counts store only ever scans this through [`crate::counts::NodeSource`]
//! and [`crate::counts::RelationshipSource`].

mod image;
mod store;
mod tokens;

pub use image::{read_image, write_image, GRAPH_STORE_FILE};
pub use store::{GraphOperation, GraphStore, NodeRecord, RelationshipRecord, TokenKind};
pub use tokens::TokenRegistry;
