//! Aggregate counts: the in-memory table, its durable dual-generation
//! image, the full-scan rebuild and the live store used by transactions.

mod generation;
mod key;
mod live;
mod rebuild;
mod table;

pub use generation::{
    DualGenerationStore, Generation, GenerationHeader, LoadedGeneration, COUNTS_FORMAT_VERSION,
    COUNTS_STORE_A, COUNTS_STORE_B, HEADER_SIZE,
};
pub use key::CounterKey;
pub use live::CountsStore;
pub use rebuild::{
    rebuild, NodeEntry, NodeSource, RelationshipEntry, RelationshipSource, REBUILD_COMPLETED,
    REBUILD_STARTED,
};
pub use table::{CountDelta, CounterTable, DeltaBatch};
