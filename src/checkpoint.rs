//! Checkpoints: materializing the counts (and the primary store) so the
//! transaction log can be reclaimed.
//!
//! A checkpoint moves through `Idle -> Flushing -> Persisting -> Committed`
//! and back to `Idle`:
//!
//! - **Flushing** takes a consistent cut: commits are paused only while the
//!   primary store and the counter table are copied.
//! - **Persisting** writes the primary image and then the inactive counts
//!   generation. No table lock is held during this IO.
//! - **Committed** lets the log drop segments up to the checkpointed
//!   transaction.
//!
//! A failure before `Committed` abandons only that attempt: the previously
//! active generation is untouched and the next checkpoint retries.

use crate::counts::{CounterTable, DualGenerationStore};
use crate::error::{CountsError, Result};
use crate::types::TransactionId;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What started a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointTrigger {
    /// Periodic; skipped when nothing committed since the last checkpoint.
    Scheduled,
    /// Explicit request; always runs.
    Forced,
    /// Clean shutdown; skipped when already up to date.
    Shutdown,
}

/// Where a checkpoint currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointState {
    Idle,
    Flushing,
    Persisting,
    Committed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Completed { transaction_id: TransactionId },
    /// Nothing new to persist.
    Skipped { transaction_id: TransactionId },
    /// Cancelled before persisting started.
    Abandoned,
}

/// State captured at a single transaction boundary.
#[derive(Debug)]
pub struct CheckpointCut<P> {
    pub transaction_id: TransactionId,
    pub counts: CounterTable,
    pub primary: P,
}

/// The engine side of a checkpoint.
pub trait CheckpointTarget: Send + Sync {
    /// Copy of the primary store taken with the cut.
    type Primary: Send;

    fn last_committed_transaction_id(&self) -> TransactionId;

    /// Copy the primary store and the counts at the same transaction,
    /// pausing commits only for the copy.
    fn consistent_cut(&self) -> Result<CheckpointCut<Self::Primary>>;

    /// Durably write the primary store image.
    fn persist_primary(&self, primary: Self::Primary, transaction_id: TransactionId) -> Result<()>;

    /// Allow the log to drop everything up to `through`.
    fn reclaim_log(&self, through: TransactionId) -> Result<()>;
}

/// Runs checkpoints one at a time against a target.
pub struct CheckpointCoordinator<T: CheckpointTarget> {
    target: Arc<T>,
    generations: Mutex<DualGenerationStore>,
    state: Mutex<CheckpointState>,
    cancel_requested: Mutex<bool>,
    last_checkpointed: Mutex<TransactionId>,
}

impl<T: CheckpointTarget> std::fmt::Debug for CheckpointCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("state", &*self.state.lock())
            .field("last_checkpointed", &*self.last_checkpointed.lock())
            .finish()
    }
}

impl<T: CheckpointTarget> CheckpointCoordinator<T> {
    /// `generations` must be the recovered pair; its active generation is
    /// taken as the last checkpoint.
    pub fn new(target: Arc<T>, generations: DualGenerationStore) -> Self {
        let last = generations.active_transaction_id().unwrap_or_default();
        Self {
            target,
            generations: Mutex::new(generations),
            state: Mutex::new(CheckpointState::Idle),
            cancel_requested: Mutex::new(false),
            last_checkpointed: Mutex::new(last),
        }
    }

    pub fn state(&self) -> CheckpointState {
        *self.state.lock()
    }

    /// Transaction id of the last completed checkpoint.
    pub fn last_checkpointed(&self) -> TransactionId {
        *self.last_checkpointed.lock()
    }

    /// Ask the running checkpoint to stop. Only honored while it is still
    /// flushing; returns whether the request was accepted.
    pub fn request_cancel(&self) -> bool {
        let state = self.state.lock();
        if *state == CheckpointState::Flushing {
            *self.cancel_requested.lock() = true;
            true
        } else {
            false
        }
    }

    /// Run one checkpoint.
    pub fn checkpoint(&self, trigger: CheckpointTrigger) -> Result<CheckpointOutcome> {
        // Serializes checkpoints
        let mut generations = self.generations.lock();

        let last = self.last_checkpointed();
        if trigger != CheckpointTrigger::Forced && self.target.last_committed_transaction_id() == last {
            debug!(?trigger, transaction_id = last.0, "Checkpoint skipped, nothing new");
            return Ok(CheckpointOutcome::Skipped { transaction_id: last });
        }

        self.set_state(CheckpointState::Flushing);
        let cut = match self.target.consistent_cut() {
            Ok(cut) => cut,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock();
            let mut cancel = self.cancel_requested.lock();
            if *cancel {
                *cancel = false;
                *state = CheckpointState::Idle;
                info!(?trigger, transaction_id = cut.transaction_id.0, "Checkpoint abandoned");
                return Ok(CheckpointOutcome::Abandoned);
            }
            *state = CheckpointState::Persisting;
        }

        let transaction_id = cut.transaction_id;
        let persisted = self
            .target
            .persist_primary(cut.primary, transaction_id)
            .and_then(|_| generations.write(&cut.counts, transaction_id));
        if let Err(e) = persisted {
            self.reset();
            return Err(e);
        }

        self.set_state(CheckpointState::Committed);
        *self.last_checkpointed.lock() = transaction_id;

        // The counts are durable at this point; a reclaim failure only
        // delays log cleanup.
        if let Err(e) = self.target.reclaim_log(transaction_id) {
            warn!(transaction_id = transaction_id.0, "Log reclamation failed: {}", e);
        }

        self.set_state(CheckpointState::Idle);
        info!(
            ?trigger,
            transaction_id = transaction_id.0,
            generation = ?generations.active_generation(),
            "Checkpoint completed"
        );
        Ok(CheckpointOutcome::Completed { transaction_id })
    }

    fn set_state(&self, state: CheckpointState) {
        *self.state.lock() = state;
    }

    fn reset(&self) {
        *self.cancel_requested.lock() = false;
        self.set_state(CheckpointState::Idle);
    }
}

/// Background thread running scheduled checkpoints.
pub struct CheckpointScheduler {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointScheduler {
    /// Start checkpointing every `interval`.
    pub fn start<T>(coordinator: Arc<CheckpointCoordinator<T>>, interval: Duration) -> Result<Self>
    where
        T: CheckpointTarget + 'static,
    {
        let (stop, stopped) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("checkpoint-scheduler".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = coordinator.checkpoint(CheckpointTrigger::Scheduled) {
                            error!("Scheduled checkpoint failed: {}", e);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(CountsError::Io)?;

        debug!(interval_ms = interval.as_millis() as u64, "Checkpoint scheduler started");
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for a running checkpoint to finish.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Checkpoint scheduler thread panicked");
            }
        }
    }
}

impl Drop for CheckpointScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::{CounterKey, COUNTS_STORE_B};
    use crate::io::MemoryMedium;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Weak;

    #[derive(Default)]
    struct FakeTarget {
        tx: AtomicU64,
        nodes: AtomicU64,
        persisted: Mutex<Vec<TransactionId>>,
        reclaimed: Mutex<Vec<TransactionId>>,
        fail_primary: AtomicBool,
        fail_reclaim: AtomicBool,
        coordinator: Mutex<Weak<CheckpointCoordinator<FakeTarget>>>,
        cancel_during_cut: AtomicBool,
    }

    impl FakeTarget {
        fn commit(&self) {
            self.nodes.fetch_add(1, Ordering::SeqCst);
            self.tx.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CheckpointTarget for FakeTarget {
        type Primary = u64;

        fn last_committed_transaction_id(&self) -> TransactionId {
            TransactionId(self.tx.load(Ordering::SeqCst))
        }

        fn consistent_cut(&self) -> Result<CheckpointCut<u64>> {
            if self.cancel_during_cut.load(Ordering::SeqCst) {
                if let Some(coordinator) = self.coordinator.lock().upgrade() {
                    assert!(coordinator.request_cancel());
                }
            }
            let nodes = self.nodes.load(Ordering::SeqCst);
            Ok(CheckpointCut {
                transaction_id: self.last_committed_transaction_id(),
                counts: CounterTable::from_entries([(CounterKey::nodes(), nodes as i64)])?,
                primary: nodes,
            })
        }

        fn persist_primary(&self, _primary: u64, transaction_id: TransactionId) -> Result<()> {
            if self.fail_primary.load(Ordering::SeqCst) {
                return Err(CountsError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.persisted.lock().push(transaction_id);
            Ok(())
        }

        fn reclaim_log(&self, through: TransactionId) -> Result<()> {
            if self.fail_reclaim.load(Ordering::SeqCst) {
                return Err(CountsError::InvalidOperation("reclaim refused".into()));
            }
            self.reclaimed.lock().push(through);
            Ok(())
        }
    }

    fn dir() -> &'static Path {
        Path::new("/db")
    }

    fn setup(medium: &MemoryMedium) -> (Arc<FakeTarget>, Arc<CheckpointCoordinator<FakeTarget>>) {
        let (mut generations, _) = DualGenerationStore::open_in(Arc::new(medium.clone()), dir());
        generations.write(&CounterTable::new(), TransactionId::BASE).unwrap();

        let target = Arc::new(FakeTarget::default());
        let coordinator = Arc::new(CheckpointCoordinator::new(target.clone(), generations));
        *target.coordinator.lock() = Arc::downgrade(&coordinator);
        (target, coordinator)
    }

    fn durable(medium: &MemoryMedium) -> (TransactionId, i64) {
        let (_, loaded) = DualGenerationStore::open_in(Arc::new(medium.crash()), dir());
        let loaded = loaded.unwrap();
        (loaded.transaction_id, loaded.table.read(CounterKey::nodes()))
    }

    #[test]
    fn test_checkpoint_persists_and_reclaims() {
        let medium = MemoryMedium::new();
        let (target, coordinator) = setup(&medium);
        target.commit();
        target.commit();

        let outcome = coordinator.checkpoint(CheckpointTrigger::Forced).unwrap();
        assert_eq!(
            outcome,
            CheckpointOutcome::Completed {
                transaction_id: TransactionId(2)
            }
        );
        assert_eq!(coordinator.state(), CheckpointState::Idle);
        assert_eq!(coordinator.last_checkpointed(), TransactionId(2));
        assert_eq!(*target.persisted.lock(), vec![TransactionId(2)]);
        assert_eq!(*target.reclaimed.lock(), vec![TransactionId(2)]);
        assert_eq!(durable(&medium), (TransactionId(2), 2));
    }

    #[test]
    fn test_scheduled_checkpoint_skipped_without_commits() {
        let medium = MemoryMedium::new();
        let (target, coordinator) = setup(&medium);

        let outcome = coordinator.checkpoint(CheckpointTrigger::Scheduled).unwrap();
        assert_eq!(
            outcome,
            CheckpointOutcome::Skipped {
                transaction_id: TransactionId::BASE
            }
        );
        assert!(target.persisted.lock().is_empty());

        // Forced runs anyway
        let outcome = coordinator.checkpoint(CheckpointTrigger::Forced).unwrap();
        assert!(matches!(outcome, CheckpointOutcome::Completed { .. }));
    }

    #[test]
    fn test_failed_checkpoint_keeps_active_generation_and_retries() {
        let medium = MemoryMedium::new();
        let (target, coordinator) = setup(&medium);
        target.commit();

        medium.fail_writes_to(dir().join(COUNTS_STORE_B));
        let result = coordinator.checkpoint(CheckpointTrigger::Scheduled);
        assert!(matches!(result, Err(CountsError::Io(_))));
        assert_eq!(coordinator.state(), CheckpointState::Idle);
        assert_eq!(coordinator.last_checkpointed(), TransactionId::BASE);
        assert!(target.reclaimed.lock().is_empty());
        assert_eq!(durable(&medium), (TransactionId::BASE, 0));

        medium.clear_failures();
        target.commit();
        let outcome = coordinator.checkpoint(CheckpointTrigger::Scheduled).unwrap();
        assert_eq!(
            outcome,
            CheckpointOutcome::Completed {
                transaction_id: TransactionId(2)
            }
        );
        assert_eq!(durable(&medium), (TransactionId(2), 2));
    }

    #[test]
    fn test_primary_failure_skips_counts_write() {
        let medium = MemoryMedium::new();
        let (target, coordinator) = setup(&medium);
        target.commit();
        target.fail_primary.store(true, Ordering::SeqCst);

        assert!(coordinator.checkpoint(CheckpointTrigger::Forced).is_err());
        assert_eq!(durable(&medium), (TransactionId::BASE, 0));
    }

    #[test]
    fn test_reclaim_failure_does_not_fail_checkpoint() {
        let medium = MemoryMedium::new();
        let (target, coordinator) = setup(&medium);
        target.commit();
        target.fail_reclaim.store(true, Ordering::SeqCst);

        let outcome = coordinator.checkpoint(CheckpointTrigger::Forced).unwrap();
        assert!(matches!(outcome, CheckpointOutcome::Completed { .. }));
        assert_eq!(durable(&medium), (TransactionId(1), 1));
    }

    #[test]
    fn test_cancel_while_flushing_abandons() {
        let medium = MemoryMedium::new();
        let (target, coordinator) = setup(&medium);
        target.commit();
        target.cancel_during_cut.store(true, Ordering::SeqCst);

        let outcome = coordinator.checkpoint(CheckpointTrigger::Forced).unwrap();
        assert_eq!(outcome, CheckpointOutcome::Abandoned);
        assert!(target.persisted.lock().is_empty());
        assert_eq!(durable(&medium), (TransactionId::BASE, 0));

        target.cancel_during_cut.store(false, Ordering::SeqCst);
        let outcome = coordinator.checkpoint(CheckpointTrigger::Forced).unwrap();
        assert!(matches!(outcome, CheckpointOutcome::Completed { .. }));
    }

    #[test]
    fn test_cancel_when_idle_is_rejected() {
        let medium = MemoryMedium::new();
        let (target, coordinator) = setup(&medium);
        target.commit();

        assert!(!coordinator.request_cancel());
        let outcome = coordinator.checkpoint(CheckpointTrigger::Forced).unwrap();
        assert!(matches!(outcome, CheckpointOutcome::Completed { .. }));
    }

    #[test]
    fn test_scheduler_checkpoints_in_background() {
        let medium = MemoryMedium::new();
        let (target, coordinator) = setup(&medium);
        target.commit();

        let mut scheduler = CheckpointScheduler::start(coordinator.clone(), Duration::from_millis(10)).unwrap();
        for _ in 0..200 {
            if coordinator.last_checkpointed() == TransactionId(1) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();

        assert_eq!(coordinator.last_checkpointed(), TransactionId(1));
        assert_eq!(durable(&medium), (TransactionId(1), 1));
    }
}
