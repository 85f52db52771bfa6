//! # Count Store
//!
//! Durable aggregate counts for a transactional graph store: the number of
//! nodes per label and relationships per type, kept consistent through
//! commits, checkpoints and crash recovery.
//!
//! ## Core Concepts
//!
//! - **Counter table**: in-memory `CounterKey -> i64`, updated by one
//!   all-or-nothing delta batch per committed transaction
//! - **Generations**: two alternating on-disk images (`A`/`B`), each stamped
//!   with the transaction it reflects
//! - **Checkpoints**: copy the table at a transaction boundary, write the
//!   inactive generation, then let the log be reclaimed
//! - **Recovery**: replay the log, then adopt a generation stamped with the
//!   recovered transaction or rebuild from a full scan
//!
//! ## Example
//!
//! ```ignore
//! use countstore::{Database, DatabaseConfig};
//!
//! let db = Database::open_or_create(DatabaseConfig {
//!     path: "./graph.db".into(),
//!     ..Default::default()
//! })?;
//!
//! let alien = db.get_or_create_label("Alien")?;
//! let mut tx = db.begin();
//! tx.create_node(&[alien]);
//! tx.commit()?;
//!
//! assert_eq!(db.count_nodes(Some(alien)), 1);
//! ```

pub mod checkpoint;
pub mod counts;
pub mod db;
pub mod error;
pub mod graph;
pub mod io;
pub mod recovery;
pub mod types;
pub mod wal;

// Re-exports
pub use checkpoint::{
    CheckpointCoordinator, CheckpointCut, CheckpointOutcome, CheckpointScheduler, CheckpointState,
    CheckpointTarget, CheckpointTrigger,
};
pub use counts::{
    rebuild, CountDelta, CounterKey, CounterTable, CountsStore, DeltaBatch, DualGenerationStore,
    Generation, GenerationHeader, LoadedGeneration, NodeEntry, NodeSource, RelationshipEntry,
    RelationshipSource, COUNTS_STORE_A, COUNTS_STORE_B, REBUILD_COMPLETED, REBUILD_STARTED,
};
pub use db::{Database, DatabaseConfig, DatabaseStats, Transaction};
pub use error::{CountsError, Result};
pub use graph::{GraphOperation, GraphStore, NodeRecord, RelationshipRecord, TokenKind, TokenRegistry};
pub use io::{DiskMedium, MediumLock, MemoryMedium, StorageMedium};
pub use recovery::{LogReplay, RebuildReason, RecoveredCounts, RecoveryBootstrapper, RecoveryOutcome};
pub use types::*;
pub use wal::{TransactionLog, WalEntry};
