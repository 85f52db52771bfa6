//! Database tying the graph store, transaction log and counts together.

use crate::checkpoint::{
    CheckpointCoordinator, CheckpointCut, CheckpointOutcome, CheckpointScheduler, CheckpointTarget,
    CheckpointTrigger,
};
use crate::counts::{
    CounterKey, CounterTable, CountsStore, DualGenerationStore, NodeEntry, NodeSource,
    RelationshipEntry, RelationshipSource,
};
use crate::error::{CountsError, Result};
use crate::graph::{read_image, write_image, GraphOperation, GraphStore, NodeRecord, TokenKind, GRAPH_STORE_FILE};
use crate::io::{DiskMedium, MediumLock, StorageMedium};
use crate::recovery::{LogReplay, RecoveryBootstrapper, RecoveryOutcome};
use crate::types::{NodeId, RelationshipId, TokenId, TransactionId};
use crate::wal::{TransactionLog, WalEntry};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Database configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding the database files.
    pub path: PathBuf,

    /// Name used in log messages.
    pub name: String,

    /// Whether `open_or_create` may create a missing database.
    pub create_if_missing: bool,

    /// Period of background checkpoints. `None` disables them.
    pub checkpoint_interval_ms: Option<u64>,

    /// Whether a clean shutdown checkpoints first.
    pub checkpoint_on_shutdown: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./graph.db"),
            name: "graph".to_string(),
            create_if_missing: true,
            checkpoint_interval_ms: Some(300_000),
            checkpoint_on_shutdown: true,
        }
    }
}

impl DatabaseConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Point-in-time summary of a database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseStats {
    pub node_count: u64,
    pub relationship_count: u64,
    pub label_count: usize,
    pub relationship_type_count: usize,
    pub last_committed: TransactionId,
    pub last_checkpointed: TransactionId,
    pub log_segments: usize,
}

/// Magic bytes for the database manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"GDB\0";

/// Current database format version.
const MANIFEST_VERSION: u8 = 1;

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";

/// Everything a commit touches. Shared with the checkpoint coordinator.
struct Engine {
    medium: Arc<dyn StorageMedium>,
    dir: PathBuf,
    graph: RwLock<GraphStore>,
    counts: CountsStore,
    log: TransactionLog,
    /// Serializes commits and checkpoint cuts.
    commit_lock: Mutex<()>,
    next_node_id: AtomicU64,
    next_relationship_id: AtomicU64,
    available: AtomicBool,
}

impl Engine {
    /// Build and commit one transaction. `build` sees the graph under the
    /// commit lock, so read-then-write sequences are not racy.
    fn commit_ops<F>(&self, build: F) -> Result<TransactionId>
    where
        F: FnOnce(&GraphStore) -> Result<Vec<GraphOperation>>,
    {
        let _guard = self.commit_lock.lock();
        if !self.available.load(Ordering::SeqCst) {
            return Err(CountsError::InvalidOperation("database is shut down".into()));
        }

        let (operations, batch) = {
            let graph = self.graph.read();
            let operations = build(&*graph)?;
            if operations.is_empty() {
                return Ok(self.counts.last_applied());
            }
            let batch = graph.prepare(&operations)?;
            (operations, batch)
        };
        self.counts.check(&batch)?;

        let transaction_id = self.log.last_committed_transaction_id().next();
        let entry = WalEntry::new(transaction_id, operations);
        self.log.append(&entry)?;

        self.graph.write().apply(&entry.operations)?;
        self.counts.on_commit(&batch, transaction_id)?;

        debug!(
            transaction_id = transaction_id.0,
            operations = entry.operations.len(),
            deltas = batch.len(),
            "Committed transaction"
        );
        Ok(transaction_id)
    }
}

impl CheckpointTarget for Engine {
    type Primary = GraphStore;

    fn last_committed_transaction_id(&self) -> TransactionId {
        self.counts.last_applied()
    }

    fn consistent_cut(&self) -> Result<CheckpointCut<GraphStore>> {
        let _guard = self.commit_lock.lock();
        let primary = self.graph.read().clone();
        let (transaction_id, counts) = self.counts.snapshot();
        Ok(CheckpointCut {
            transaction_id,
            counts,
            primary,
        })
    }

    fn persist_primary(&self, primary: GraphStore, transaction_id: TransactionId) -> Result<()> {
        write_image(
            self.medium.as_ref(),
            &self.dir.join(GRAPH_STORE_FILE),
            transaction_id,
            &primary,
        )
    }

    fn reclaim_log(&self, through: TransactionId) -> Result<()> {
        self.log.rotate()?;
        self.log.prune_through(through)?;
        Ok(())
    }
}

/// The graph store while the log is replayed into it.
struct ReplayContext<'a> {
    graph: GraphStore,
    log: &'a TransactionLog,
    /// Transaction the graph image reflects.
    base: TransactionId,
}

impl LogReplay for ReplayContext<'_> {
    fn replay_and_wait(&mut self) -> Result<TransactionId> {
        let graph = &mut self.graph;
        let last = self.log.replay(self.base, |entry| {
            graph.apply(&entry.operations)?;
            Ok(())
        })?;
        Ok(last.max(self.log.last_committed_transaction_id()))
    }
}

impl NodeSource for ReplayContext<'_> {
    fn enumerate_nodes(&self) -> Box<dyn Iterator<Item = Result<NodeEntry>> + '_> {
        self.graph.enumerate_nodes()
    }
}

impl RelationshipSource for ReplayContext<'_> {
    fn enumerate_relationships(&self) -> Box<dyn Iterator<Item = Result<RelationshipEntry>> + '_> {
        self.graph.enumerate_relationships()
    }
}

/// A graph database with durable aggregate counts.
///
/// Opening a database replays its transaction log and recovers the counts
/// before it is handed out, so every query sees a consistent state.
pub struct Database {
    config: DatabaseConfig,
    engine: Arc<Engine>,
    checkpoints: Arc<CheckpointCoordinator<Engine>>,
    scheduler: Mutex<Option<CheckpointScheduler>>,
    recovery: RecoveryOutcome,
    shut_down: AtomicBool,
    _lock: MediumLock,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("path", &self.config.path)
            .field("last_committed", &self.last_committed_transaction_id())
            .finish()
    }
}

impl Database {
    /// Open an existing database or create a new one.
    pub fn open_or_create(config: DatabaseConfig) -> Result<Self> {
        Self::open_or_create_with_medium(config, Arc::new(DiskMedium::new()))
    }

    /// Create a new database on disk.
    pub fn create(config: DatabaseConfig) -> Result<Self> {
        Self::create_with_medium(config, Arc::new(DiskMedium::new()))
    }

    /// Open an existing database on disk.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::open_with_medium(config, Arc::new(DiskMedium::new()))
    }

    pub fn open_or_create_with_medium(config: DatabaseConfig, medium: Arc<dyn StorageMedium>) -> Result<Self> {
        if medium.exists(&config.path.join(MANIFEST_FILE)) {
            Self::open_with_medium(config, medium)
        } else if config.create_if_missing {
            Self::create_with_medium(config, medium)
        } else {
            Err(CountsError::NotInitialized)
        }
    }

    /// Create a new database. It starts with an empty counts generation at
    /// transaction 0, so its first open adopts rather than rebuilds.
    pub fn create_with_medium(config: DatabaseConfig, medium: Arc<dyn StorageMedium>) -> Result<Self> {
        let dir = config.path.clone();
        if medium.exists(&dir.join(MANIFEST_FILE)) {
            return Err(CountsError::InvalidOperation(format!(
                "database already exists at {}",
                dir.display()
            )));
        }

        medium.create_dir_all(&dir)?;
        let lock = medium.lock(&dir.join(LOCK_FILE))?;

        let (mut generations, _) = DualGenerationStore::open_in(medium.clone(), &dir);
        generations.write(&CounterTable::new(), TransactionId::BASE)?;
        Self::write_manifest(medium.as_ref(), &dir)?;

        info!(name = %config.name, path = %dir.display(), "Created database");
        Self::start(config, medium, lock)
    }

    /// Open an existing database, replaying its log and recovering counts.
    pub fn open_with_medium(config: DatabaseConfig, medium: Arc<dyn StorageMedium>) -> Result<Self> {
        Self::verify_manifest(medium.as_ref(), &config.path)?;
        let lock = medium.lock(&config.path.join(LOCK_FILE))?;
        Self::start(config, medium, lock)
    }

    fn start(config: DatabaseConfig, medium: Arc<dyn StorageMedium>, lock: MediumLock) -> Result<Self> {
        let dir = config.path.clone();

        let (base, graph) = read_image(medium.as_ref(), &dir.join(GRAPH_STORE_FILE))?
            .unwrap_or_else(|| (TransactionId::BASE, GraphStore::new()));
        let log = TransactionLog::open(medium.clone(), &dir, base)?;

        let mut replay = ReplayContext {
            graph,
            log: &log,
            base,
        };
        let recovered = RecoveryBootstrapper::new(medium.clone(), &dir).recover(&mut replay)?;
        let graph = replay.graph;

        let engine = Arc::new(Engine {
            next_node_id: AtomicU64::new(graph.next_node_id().0),
            next_relationship_id: AtomicU64::new(graph.next_relationship_id().0),
            medium,
            dir,
            graph: RwLock::new(graph),
            counts: recovered.counts,
            log,
            commit_lock: Mutex::new(()),
            available: AtomicBool::new(true),
        });
        let checkpoints = Arc::new(CheckpointCoordinator::new(engine.clone(), recovered.generations));

        let scheduler = match config.checkpoint_interval_ms {
            Some(ms) => Some(CheckpointScheduler::start(
                checkpoints.clone(),
                Duration::from_millis(ms),
            )?),
            None => None,
        };

        info!(
            transaction_id = recovered.transaction_id.0,
            recovery = ?recovered.outcome,
            "Database {} is ready.",
            config.name
        );

        Ok(Self {
            config,
            engine,
            checkpoints,
            scheduler: Mutex::new(scheduler),
            recovery: recovered.outcome,
            shut_down: AtomicBool::new(false),
            _lock: lock,
        })
    }

    // --- Transactions ---

    /// Start a transaction. Nothing is visible until it commits; dropping
    /// it uncommitted rolls it back.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            db: self,
            operations: Vec::new(),
            committed: false,
        }
    }

    /// Id of a label, creating it if needed.
    pub fn get_or_create_label(&self, name: &str) -> Result<TokenId> {
        self.get_or_create_token(TokenKind::Label, name)
    }

    /// Id of a relationship type, creating it if needed.
    pub fn get_or_create_relationship_type(&self, name: &str) -> Result<TokenId> {
        self.get_or_create_token(TokenKind::RelationshipType, name)
    }

    fn get_or_create_token(&self, kind: TokenKind, name: &str) -> Result<TokenId> {
        if let Some(id) = self.token_id(kind, name) {
            return Ok(id);
        }

        let mut token = None;
        self.engine.commit_ops(|graph| {
            let registry = match kind {
                TokenKind::Label => graph.labels(),
                TokenKind::RelationshipType => graph.relationship_types(),
            };
            // Another commit may have created it meanwhile
            if let Some(id) = registry.id_of(name) {
                token = Some(id);
                return Ok(Vec::new());
            }
            let id = registry.next_id();
            token = Some(id);
            Ok(vec![GraphOperation::CreateToken {
                kind,
                id,
                name: name.to_string(),
            }])
        })?;

        token.ok_or_else(|| CountsError::TokenNotFound(name.to_string()))
    }

    fn token_id(&self, kind: TokenKind, name: &str) -> Option<TokenId> {
        let graph = self.engine.graph.read();
        match kind {
            TokenKind::Label => graph.labels().id_of(name),
            TokenKind::RelationshipType => graph.relationship_types().id_of(name),
        }
    }

    pub fn label_id(&self, name: &str) -> Option<TokenId> {
        self.token_id(TokenKind::Label, name)
    }

    pub fn relationship_type_id(&self, name: &str) -> Option<TokenId> {
        self.token_id(TokenKind::RelationshipType, name)
    }

    // --- Queries ---

    pub fn count_for(&self, key: CounterKey) -> i64 {
        self.engine.counts.count_for(key)
    }

    /// Number of nodes, or of nodes carrying `label`.
    pub fn count_nodes(&self, label: Option<TokenId>) -> i64 {
        match label {
            Some(label) => self.count_for(CounterKey::label(label)),
            None => self.count_for(CounterKey::nodes()),
        }
    }

    /// Number of relationships, or of relationships of `rel_type`.
    pub fn count_relationships(&self, rel_type: Option<TokenId>) -> i64 {
        match rel_type {
            Some(rel_type) => self.count_for(CounterKey::relationship_type(rel_type)),
            None => self.count_for(CounterKey::relationships()),
        }
    }

    pub fn nodes_with_label(&self, label: TokenId) -> Vec<NodeId> {
        self.engine.graph.read().nodes_with_label(label)
    }

    pub fn node(&self, id: NodeId) -> Option<NodeRecord> {
        self.engine.graph.read().node(id).cloned()
    }

    pub fn last_committed_transaction_id(&self) -> TransactionId {
        self.engine.counts.last_applied()
    }

    /// How the counts were recovered when this database was opened.
    pub fn recovery_outcome(&self) -> RecoveryOutcome {
        self.recovery
    }

    pub fn stats(&self) -> DatabaseStats {
        let graph = self.engine.graph.read();
        DatabaseStats {
            node_count: graph.node_count() as u64,
            relationship_count: graph.relationship_count() as u64,
            label_count: graph.labels().len(),
            relationship_type_count: graph.relationship_types().len(),
            last_committed: self.engine.counts.last_applied(),
            last_checkpointed: self.checkpoints.last_checkpointed(),
            log_segments: self.engine.log.segment_count(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Lifecycle ---

    /// Force a checkpoint now.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.checkpoints.checkpoint(CheckpointTrigger::Forced)
    }

    /// Stop background checkpoints, checkpoint if configured, and refuse
    /// further commits. Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }

        {
            // Waits for an in-flight commit
            let _guard = self.engine.commit_lock.lock();
            self.engine.available.store(false, Ordering::SeqCst);
        }

        let result = if self.config.checkpoint_on_shutdown {
            self.checkpoints.checkpoint(CheckpointTrigger::Shutdown).map(|_| ())
        } else {
            Ok(())
        };

        info!("Database {} is unavailable.", self.config.name);
        result
    }

    // --- Private Helpers ---

    fn write_manifest(medium: &dyn StorageMedium, dir: &Path) -> Result<()> {
        let mut manifest = Vec::with_capacity(5);
        manifest.extend_from_slice(MANIFEST_MAGIC);
        manifest.push(MANIFEST_VERSION);
        medium.replace_file(&dir.join(MANIFEST_FILE), &manifest)
    }

    fn verify_manifest(medium: &dyn StorageMedium, dir: &Path) -> Result<()> {
        let manifest = medium
            .read_file(&dir.join(MANIFEST_FILE))?
            .ok_or(CountsError::NotInitialized)?;

        if manifest.len() < 5 || &manifest[0..4] != MANIFEST_MAGIC {
            return Err(CountsError::InvalidFormat("Invalid database magic".into()));
        }
        if manifest[4] != MANIFEST_VERSION {
            return Err(CountsError::InvalidFormat(format!(
                "Unsupported database version: {}",
                manifest[4]
            )));
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best-effort clean shutdown
        if let Err(e) = self.shutdown() {
            error!("Shutdown of database {} failed: {}", self.config.name, e);
        }
    }
}

/// Uncommitted changes to a [`Database`].
///
/// Node and relationship ids are handed out as operations are staged; ids
/// of a rolled back transaction are not reused.
pub struct Transaction<'db> {
    db: &'db Database,
    operations: Vec<GraphOperation>,
    committed: bool,
}

impl Transaction<'_> {
    pub fn create_node(&mut self, labels: &[TokenId]) -> NodeId {
        let id = NodeId(self.db.engine.next_node_id.fetch_add(1, Ordering::SeqCst));
        self.operations.push(GraphOperation::CreateNode {
            id,
            labels: labels.to_vec(),
        });
        id
    }

    pub fn delete_node(&mut self, id: NodeId) {
        self.operations.push(GraphOperation::DeleteNode { id });
    }

    pub fn add_label(&mut self, node: NodeId, label: TokenId) {
        self.operations.push(GraphOperation::AddLabel { node, label });
    }

    pub fn remove_label(&mut self, node: NodeId, label: TokenId) {
        self.operations.push(GraphOperation::RemoveLabel { node, label });
    }

    pub fn create_relationship(&mut self, rel_type: TokenId, start: NodeId, end: NodeId) -> RelationshipId {
        let id = RelationshipId(self.db.engine.next_relationship_id.fetch_add(1, Ordering::SeqCst));
        self.operations.push(GraphOperation::CreateRelationship {
            id,
            rel_type,
            start,
            end,
        });
        id
    }

    pub fn delete_relationship(&mut self, id: RelationshipId) {
        self.operations.push(GraphOperation::DeleteRelationship { id });
    }

    /// Operations staged so far.
    pub fn operations(&self) -> &[GraphOperation] {
        &self.operations
    }

    /// Validate and commit. On error nothing is applied.
    pub fn commit(mut self) -> Result<TransactionId> {
        let operations = std::mem::take(&mut self.operations);
        let transaction_id = self.db.engine.commit_ops(|_| Ok(operations))?;
        self.committed = true;
        Ok(transaction_id)
    }

    /// Discard all staged operations.
    pub fn rollback(self) {}
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.operations.is_empty() {
            debug!(operations = self.operations.len(), "Rolled back transaction");
        }
    }
}
