//! Integration tests for the database on a real filesystem.

use countstore::{
    CheckpointOutcome, CounterKey, Database, DatabaseConfig, RecoveryOutcome, TransactionId,
    COUNTS_STORE_A, COUNTS_STORE_B,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        path: dir.path().join("graph.db"),
        name: "integration".to_string(),
        create_if_missing: true,
        checkpoint_interval_ms: None,
        checkpoint_on_shutdown: true,
    }
}

// --- Realistic Workflow Tests ---

#[test]
fn test_social_graph_workflow() {
    let dir = TempDir::new().unwrap();
    let db = Database::open_or_create(test_config(&dir)).unwrap();

    let person = db.get_or_create_label("Person").unwrap();
    let admin = db.get_or_create_label("Admin").unwrap();
    let follows = db.get_or_create_relationship_type("FOLLOWS").unwrap();
    let blocks = db.get_or_create_relationship_type("BLOCKS").unwrap();

    let mut tx = db.begin();
    let alice = tx.create_node(&[person, admin]);
    let bob = tx.create_node(&[person]);
    let carol = tx.create_node(&[person]);
    tx.create_relationship(follows, alice, bob);
    tx.create_relationship(follows, bob, carol);
    let spam = tx.create_relationship(blocks, carol, alice);
    tx.commit().unwrap();

    assert_eq!(db.count_nodes(Some(person)), 3);
    assert_eq!(db.count_nodes(Some(admin)), 1);
    assert_eq!(db.count_relationships(Some(follows)), 2);
    assert_eq!(db.count_relationships(None), 3);

    // Alice steps down, the block is lifted
    let mut tx = db.begin();
    tx.remove_label(alice, admin);
    tx.delete_relationship(spam);
    tx.commit().unwrap();

    assert_eq!(db.count_nodes(Some(admin)), 0);
    assert_eq!(db.count_relationships(Some(blocks)), 0);
    assert_eq!(db.count_relationships(None), 2);
    assert_eq!(db.count_for(CounterKey::nodes()), 3);
}

#[test]
fn test_reopen_after_clean_shutdown_adopts_counts() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let db = Database::create(config.clone()).unwrap();
        let label = db.get_or_create_label("City").unwrap();
        for _ in 0..10 {
            let mut tx = db.begin();
            tx.create_node(&[label]);
            tx.commit().unwrap();
        }
    }

    assert!(config.path.join(COUNTS_STORE_A).exists());
    assert!(config.path.join(COUNTS_STORE_B).exists());

    let db = Database::open(config).unwrap();
    assert!(matches!(db.recovery_outcome(), RecoveryOutcome::Adopted { .. }));
    assert_eq!(db.count_nodes(db.label_id("City")), 10);
    assert_eq!(db.last_committed_transaction_id(), TransactionId(11));
}

#[test]
fn test_rebuild_on_disk_after_counts_deleted() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    {
        let db = Database::create(config.clone()).unwrap();
        let alien = db.get_or_create_label("Alien").unwrap();
        let mut tx = db.begin();
        for _ in 0..5 {
            tx.create_node(&[alien]);
        }
        tx.commit().unwrap();
    }

    std::fs::remove_file(config.path.join(COUNTS_STORE_A)).unwrap();
    std::fs::remove_file(config.path.join(COUNTS_STORE_B)).unwrap();

    let db = Database::open(config).unwrap();
    assert!(matches!(db.recovery_outcome(), RecoveryOutcome::Rebuilt { .. }));
    assert_eq!(db.count_nodes(db.label_id("Alien")), 5);
}

#[test]
fn test_reads_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let db = Database::create(test_config(&dir)).unwrap();
    let label = db.get_or_create_label("Thing").unwrap();
    let mut tx = db.begin();
    tx.create_node(&[label]);
    tx.create_node(&[label]);
    tx.commit().unwrap();

    let first = db.count_nodes(Some(label));
    for _ in 0..100 {
        assert_eq!(db.count_nodes(Some(label)), first);
    }
    // Reading an unknown token never creates a counter
    assert_eq!(db.count_nodes(Some(countstore::TokenId(999))), 0);
    db.checkpoint().unwrap();
    assert_eq!(db.count_nodes(Some(label)), first);
}

#[test]
fn test_concurrent_readers_see_whole_batches() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::create(test_config(&dir)).unwrap());
    let left = db.get_or_create_label("Left").unwrap();
    let right = db.get_or_create_label("Right").unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    // Every transaction adds one node to each side
                    let total = db.count_nodes(None);
                    assert_eq!(total % 2, 0);
                }
            })
        })
        .collect();

    for _ in 0..50 {
        let mut tx = db.begin();
        tx.create_node(&[left]);
        tx.create_node(&[right]);
        tx.commit().unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(db.count_nodes(Some(left)), 50);
    assert_eq!(db.count_nodes(Some(right)), 50);
}

#[test]
fn test_concurrent_token_creation() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::create(test_config(&dir)).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || db.get_or_create_label("Shared").unwrap())
        })
        .collect();
    let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(db.stats().label_count, 1);
    assert_eq!(db.last_committed_transaction_id(), TransactionId(1));
}

#[test]
fn test_scheduled_checkpoints() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        checkpoint_interval_ms: Some(20),
        ..test_config(&dir)
    };
    let db = Database::create(config).unwrap();
    let label = db.get_or_create_label("Tick").unwrap();
    let mut tx = db.begin();
    tx.create_node(&[label]);
    let committed = tx.commit().unwrap();

    for _ in 0..250 {
        if db.stats().last_checkpointed == committed {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(db.stats().last_checkpointed, committed);

    // Nothing new since: a forced checkpoint still runs, a shutdown one is skipped
    assert!(matches!(db.checkpoint().unwrap(), CheckpointOutcome::Completed { .. }));
    db.shutdown().unwrap();
}

#[test]
fn test_checkpoint_prunes_log_segments() {
    let dir = TempDir::new().unwrap();
    let db = Database::create(test_config(&dir)).unwrap();
    let label = db.get_or_create_label("Log").unwrap();

    for round in 0..3 {
        for _ in 0..5 {
            let mut tx = db.begin();
            tx.create_node(&[label]);
            tx.commit().unwrap();
        }
        db.checkpoint().unwrap();
        assert_eq!(db.stats().log_segments, 1, "round {}", round);
    }

    let segments = std::fs::read_dir(db.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("txlog."))
        .count();
    assert_eq!(segments, 1);
}
