//! Startup recovery of the counts store.
//!
//! Recovery runs once, single-threaded, before a database becomes
//! available:
//!
//! 1. replay the transaction log and wait until the primary stores reflect
//!    the last committed transaction `T`;
//! 2. open both counts generations;
//! 3. adopt the current generation if it is stamped exactly `T`;
//! 4. otherwise rebuild from the recovered primary stores and persist the
//!    result, stamped `T`, as the first generation.
//!
//! A generation stamped with any other id is never patched up from the log.

use crate::counts::{
    rebuild, CounterTable, CountsStore, DualGenerationStore, Generation, NodeSource,
    RelationshipSource,
};
use crate::error::Result;
use crate::io::StorageMedium;
use crate::types::TransactionId;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Brings the primary stores up to date with the transaction log.
pub trait LogReplay {
    /// Replay every logged transaction not yet reflected in the primary
    /// stores and return the last committed transaction id.
    fn replay_and_wait(&mut self) -> Result<TransactionId>;
}

/// Why the counts had to be rebuilt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebuildReason {
    /// Neither generation was valid.
    Missing,
    /// The current generation predates the recovered transaction.
    Stale { generation_tx: TransactionId },
    /// The current generation claims transactions the log does not have.
    Ahead { generation_tx: TransactionId },
}

/// How the counts were recovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Adopted { generation: Generation },
    Rebuilt { reason: RebuildReason },
}

/// Counts ready to be handed to the live engine.
#[derive(Debug)]
pub struct RecoveredCounts {
    /// The generation pair, with the recovered table as its active image.
    pub generations: DualGenerationStore,
    pub counts: CountsStore,
    pub transaction_id: TransactionId,
    pub outcome: RecoveryOutcome,
}

/// Runs the adopt-or-rebuild decision for one database directory.
#[derive(Debug)]
pub struct RecoveryBootstrapper {
    medium: Arc<dyn StorageMedium>,
    dir: PathBuf,
}

impl RecoveryBootstrapper {
    pub fn new(medium: Arc<dyn StorageMedium>, dir: impl Into<PathBuf>) -> Self {
        Self {
            medium,
            dir: dir.into(),
        }
    }

    /// Recover the counts against `source`, which replays the log into
    /// the primary stores and is then scanned if a rebuild is needed.
    ///
    /// A failed rebuild, or a failure to persist the rebuilt table, is
    /// fatal.
    pub fn recover<S>(&self, source: &mut S) -> Result<RecoveredCounts>
    where
        S: LogReplay + NodeSource + RelationshipSource,
    {
        let transaction_id = source.replay_and_wait()?;
        debug!(transaction_id = transaction_id.0, "Log replay finished");

        let (mut generations, loaded) = DualGenerationStore::open_in(self.medium.clone(), &self.dir);

        let reason = match loaded {
            Some(loaded) if loaded.transaction_id == transaction_id => {
                info!(
                    generation = %loaded.generation,
                    transaction_id = transaction_id.0,
                    "Adopted counts store generation"
                );
                return Ok(RecoveredCounts {
                    generations,
                    counts: CountsStore::new(loaded.table, transaction_id),
                    transaction_id,
                    outcome: RecoveryOutcome::Adopted {
                        generation: loaded.generation,
                    },
                });
            }
            Some(loaded) if loaded.transaction_id < transaction_id => RebuildReason::Stale {
                generation_tx: loaded.transaction_id,
            },
            Some(loaded) => RebuildReason::Ahead {
                generation_tx: loaded.transaction_id,
            },
            None => RebuildReason::Missing,
        };

        match reason {
            RebuildReason::Missing => {
                info!(
                    reason = ?reason,
                    transaction_id = transaction_id.0,
                    "No valid counts store generation"
                );
            }
            RebuildReason::Stale { generation_tx } => {
                info!(
                    reason = ?reason,
                    generation_tx = generation_tx.0,
                    transaction_id = transaction_id.0,
                    "Counts store is older than the log"
                );
            }
            RebuildReason::Ahead { generation_tx } => {
                warn!(
                    reason = ?reason,
                    generation_tx = generation_tx.0,
                    transaction_id = transaction_id.0,
                    "Counts store is ahead of the log, discarding it"
                );
                generations.discard()?;
            }
        }

        let table: CounterTable = rebuild(&*source, &*source, transaction_id)?;
        generations.write(&table, transaction_id)?;

        Ok(RecoveredCounts {
            generations,
            counts: CountsStore::new(table, transaction_id),
            transaction_id,
            outcome: RecoveryOutcome::Rebuilt { reason },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::{CounterKey, NodeEntry, RelationshipEntry, COUNTS_STORE_A, COUNTS_STORE_B};
    use crate::error::CountsError;
    use crate::io::MemoryMedium;
    use crate::types::{NodeId, RelationshipId, TokenId};
    use std::path::Path;

    /// Primary stores whose contents only become visible once replayed.
    struct FakeStores {
        replayed: bool,
        replay_calls: usize,
        last_tx: TransactionId,
        nodes: Vec<NodeEntry>,
        relationships: Vec<RelationshipEntry>,
        fail_scan: bool,
    }

    impl FakeStores {
        fn new(last_tx: u64, nodes: &[&[u32]], relationships: &[u32]) -> Self {
            Self {
                replayed: false,
                replay_calls: 0,
                last_tx: TransactionId(last_tx),
                nodes: nodes
                    .iter()
                    .enumerate()
                    .map(|(i, labels)| NodeEntry {
                        id: NodeId(i as u64),
                        labels: labels.iter().map(|t| TokenId(*t)).collect(),
                    })
                    .collect(),
                relationships: relationships
                    .iter()
                    .enumerate()
                    .map(|(i, t)| RelationshipEntry {
                        id: RelationshipId(i as u64),
                        rel_type: TokenId(*t),
                    })
                    .collect(),
                fail_scan: false,
            }
        }
    }

    impl LogReplay for FakeStores {
        fn replay_and_wait(&mut self) -> Result<TransactionId> {
            self.replayed = true;
            self.replay_calls += 1;
            Ok(self.last_tx)
        }
    }

    impl NodeSource for FakeStores {
        fn enumerate_nodes(&self) -> Box<dyn Iterator<Item = Result<NodeEntry>> + '_> {
            assert!(self.replayed, "scanned before replay");
            if self.fail_scan {
                return Box::new(std::iter::once(Err(CountsError::Corruption("bad record".into()))));
            }
            Box::new(self.nodes.iter().cloned().map(Ok))
        }
    }

    impl RelationshipSource for FakeStores {
        fn enumerate_relationships(&self) -> Box<dyn Iterator<Item = Result<RelationshipEntry>> + '_> {
            Box::new(self.relationships.iter().copied().map(Ok))
        }
    }

    fn dir() -> &'static Path {
        Path::new("/db")
    }

    fn bootstrapper(medium: &MemoryMedium) -> RecoveryBootstrapper {
        RecoveryBootstrapper::new(Arc::new(medium.clone()), dir())
    }

    fn seed_generation(medium: &MemoryMedium, nodes: i64, tx: u64) {
        let (mut store, _) = DualGenerationStore::open_in(Arc::new(medium.clone()), dir());
        let table = CounterTable::from_entries([(CounterKey::nodes(), nodes)]).unwrap();
        store.write(&table, TransactionId(tx)).unwrap();
    }

    #[test]
    fn test_missing_generations_rebuild_and_persist() {
        let medium = MemoryMedium::new();
        let mut stores = FakeStores::new(7, &[&[0], &[0, 1], &[]], &[3]);

        let recovered = bootstrapper(&medium).recover(&mut stores).unwrap();

        assert_eq!(
            recovered.outcome,
            RecoveryOutcome::Rebuilt {
                reason: RebuildReason::Missing
            }
        );
        assert_eq!(stores.replay_calls, 1);
        assert_eq!(recovered.transaction_id, TransactionId(7));
        assert_eq!(recovered.counts.count_for(CounterKey::nodes()), 3);
        assert_eq!(recovered.counts.count_for(CounterKey::label(TokenId(0))), 2);
        assert_eq!(recovered.counts.count_for(CounterKey::relationship_type(TokenId(3))), 1);
        assert_eq!(recovered.generations.active_transaction_id(), Some(TransactionId(7)));

        // The rebuilt table is now durable and adopted next time
        let mut stores = FakeStores::new(7, &[&[0], &[0, 1], &[]], &[3]);
        let again = bootstrapper(&medium.crash()).recover(&mut stores).unwrap();
        assert_eq!(
            again.outcome,
            RecoveryOutcome::Adopted {
                generation: Generation::A
            }
        );
        assert_eq!(again.counts.count_for(CounterKey::nodes()), 3);
    }

    #[test]
    fn test_matching_generation_adopted_without_scan() {
        let medium = MemoryMedium::new();
        seed_generation(&medium, 42, 5);

        let mut stores = FakeStores::new(5, &[], &[]);
        stores.fail_scan = true;
        let recovered = bootstrapper(&medium).recover(&mut stores).unwrap();

        assert!(matches!(recovered.outcome, RecoveryOutcome::Adopted { .. }));
        assert_eq!(recovered.counts.count_for(CounterKey::nodes()), 42);
        assert_eq!(recovered.counts.last_applied(), TransactionId(5));
    }

    #[test]
    fn test_stale_generation_rebuilt_from_primary() {
        let medium = MemoryMedium::new();
        seed_generation(&medium, 42, 3);

        let mut stores = FakeStores::new(5, &[&[], &[]], &[]);
        let recovered = bootstrapper(&medium).recover(&mut stores).unwrap();

        assert_eq!(
            recovered.outcome,
            RecoveryOutcome::Rebuilt {
                reason: RebuildReason::Stale {
                    generation_tx: TransactionId(3)
                }
            }
        );
        assert_eq!(recovered.counts.count_for(CounterKey::nodes()), 2);
        // Written to the other generation, the stale one stays intact
        assert_eq!(recovered.generations.active_generation(), Some(Generation::B));
    }

    #[test]
    fn test_generation_ahead_of_log_discarded() {
        let medium = MemoryMedium::new();
        seed_generation(&medium, 1, 4);
        seed_generation(&medium, 9, 9);

        let mut stores = FakeStores::new(6, &[&[]], &[]);
        let recovered = bootstrapper(&medium).recover(&mut stores).unwrap();

        assert_eq!(
            recovered.outcome,
            RecoveryOutcome::Rebuilt {
                reason: RebuildReason::Ahead {
                    generation_tx: TransactionId(9)
                }
            }
        );
        assert_eq!(recovered.generations.active_generation(), Some(Generation::A));
        assert!(!medium.exists(&dir().join(COUNTS_STORE_B)));

        let (_, loaded) = DualGenerationStore::open_in(Arc::new(medium.clone()), dir());
        let loaded = loaded.unwrap();
        assert_eq!(loaded.transaction_id, TransactionId(6));
        assert_eq!(loaded.table.read(CounterKey::nodes()), 1);
    }

    #[test]
    fn test_rebuild_failure_is_fatal() {
        let medium = MemoryMedium::new();
        let mut stores = FakeStores::new(1, &[&[]], &[]);
        stores.fail_scan = true;

        let result = bootstrapper(&medium).recover(&mut stores);
        assert!(matches!(result, Err(CountsError::RebuildFailure { .. })));
        assert!(!medium.exists(&dir().join(COUNTS_STORE_A)));
    }

    #[test]
    fn test_persist_failure_is_fatal() {
        let medium = MemoryMedium::new();
        medium.fail_writes_to(dir().join(COUNTS_STORE_A));
        let mut stores = FakeStores::new(1, &[&[]], &[]);

        let result = bootstrapper(&medium).recover(&mut stores);
        assert!(matches!(result, Err(CountsError::Io(_))));
    }
}
