//! Live counts shared between committing transactions and readers.

use super::key::CounterKey;
use super::table::{CounterTable, DeltaBatch};
use crate::error::{CountsError, Result};
use crate::types::TransactionId;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Table and the transaction it reflects, published as one immutable value.
#[derive(Debug)]
struct Published {
    table: CounterTable,
    last_applied: TransactionId,
}

/// The counter table once recovery has handed it over.
///
/// Readers load the current published table without taking a lock. A commit
/// applies its batch to a private copy and then swaps the copy in, so a
/// reader sees each batch either entirely or not at all and never waits for
/// a writer. Writers are serialized by their own mutex.
#[derive(Debug)]
pub struct CountsStore {
    published: ArcSwap<Published>,
    writer: Mutex<()>,
}

impl CountsStore {
    /// Wrap a recovered table that reflects every transaction up to
    /// `last_applied`.
    pub fn new(table: CounterTable, last_applied: TransactionId) -> Self {
        Self {
            published: ArcSwap::from_pointee(Published {
                table,
                last_applied,
            }),
            writer: Mutex::new(()),
        }
    }

    /// Apply the deltas of a committed transaction.
    ///
    /// Transactions must arrive exactly once and in commit order. A batch
    /// that would drive a counter negative is rejected and nothing changes.
    pub fn on_commit(&self, batch: &DeltaBatch, transaction_id: TransactionId) -> Result<()> {
        let _writer = self.writer.lock();
        let current = self.published.load_full();
        if transaction_id <= current.last_applied {
            return Err(CountsError::OutOfOrderCommit {
                last: current.last_applied,
                got: transaction_id,
            });
        }

        let mut table = current.table.clone();
        table.apply(batch)?;
        self.published.store(Arc::new(Published {
            table,
            last_applied: transaction_id,
        }));
        Ok(())
    }

    /// Validate a batch against the current counts without applying it.
    pub fn check(&self, batch: &DeltaBatch) -> Result<()> {
        self.published.load().table.check(batch)
    }

    pub fn count_for(&self, key: CounterKey) -> i64 {
        self.published.load().table.read(key)
    }

    /// Point-in-time copy of the table with the transaction it reflects.
    pub fn snapshot(&self) -> (TransactionId, CounterTable) {
        let published = self.published.load();
        (published.last_applied, published.table.clone())
    }

    pub fn last_applied(&self) -> TransactionId {
        self.published.load().last_applied
    }
}
