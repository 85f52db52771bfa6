//! In-memory counter table and delta batches.

use super::key::CounterKey;
use crate::error::{CountsError, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// A single signed change to one counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountDelta {
    pub key: CounterKey,
    pub delta: i64,
}

/// Counter changes produced by one committing transaction.
///
/// Deltas keep the order in which the transaction produced them; the same key
/// may appear more than once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeltaBatch {
    deltas: Vec<CountDelta>,
}

impl DeltaBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change. Zero deltas are dropped.
    pub fn add(&mut self, key: CounterKey, delta: i64) -> &mut Self {
        if delta != 0 {
            self.deltas.push(CountDelta { key, delta });
        }
        self
    }

    pub fn increment(&mut self, key: CounterKey) -> &mut Self {
        self.add(key, 1)
    }

    pub fn decrement(&mut self, key: CounterKey) -> &mut Self {
        self.add(key, -1)
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CountDelta> {
        self.deltas.iter()
    }
}

impl FromIterator<(CounterKey, i64)> for DeltaBatch {
    fn from_iter<I: IntoIterator<Item = (CounterKey, i64)>>(iter: I) -> Self {
        let mut batch = DeltaBatch::new();
        for (key, delta) in iter {
            batch.add(key, delta);
        }
        batch
    }
}

/// Aggregate counts keyed by [`CounterKey`].
///
/// Absent keys read as zero, and counters that drop back to zero are removed
/// so that two tables describing the same graph compare equal no matter how
/// they were built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterTable {
    counts: BTreeMap<CounterKey, i64>,
}

impl CounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(key, count)` entries.
    ///
    /// Fails on duplicate keys or negative counts; zero counts are skipped.
    pub fn from_entries(entries: impl IntoIterator<Item = (CounterKey, i64)>) -> Result<Self> {
        let mut counts = BTreeMap::new();
        for (key, count) in entries {
            if count < 0 {
                return Err(CountsError::NegativeCount {
                    key,
                    current: count,
                    delta: 0,
                });
            }
            if counts.insert(key, count).is_some() {
                return Err(CountsError::InvalidFormat(format!(
                    "duplicate counter {}",
                    key
                )));
            }
        }
        counts.retain(|_, count| *count != 0);
        Ok(Self { counts })
    }

    /// Apply every delta of a batch, or none of them.
    ///
    /// Resulting counts are computed in a scratch map first; the table is only
    /// touched once the whole batch is known to be valid.
    pub fn apply(&mut self, batch: &DeltaBatch) -> Result<()> {
        let staged = self.stage(batch)?;
        for (key, count) in staged {
            if count == 0 {
                self.counts.remove(&key);
            } else {
                self.counts.insert(key, count);
            }
        }
        Ok(())
    }

    /// Check that a batch would apply cleanly, without changing the table.
    pub fn check(&self, batch: &DeltaBatch) -> Result<()> {
        self.stage(batch).map(|_| ())
    }

    fn stage(&self, batch: &DeltaBatch) -> Result<BTreeMap<CounterKey, i64>> {
        let mut staged: BTreeMap<CounterKey, i64> = BTreeMap::new();
        for CountDelta { key, delta } in batch.iter().copied() {
            let current = match staged.entry(key) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(self.read(key)),
            };
            let updated = current
                .checked_add(delta)
                .ok_or(CountsError::CountOverflow { key })?;
            if updated < 0 {
                return Err(CountsError::NegativeCount {
                    key,
                    current: *current,
                    delta,
                });
            }
            *current = updated;
        }
        Ok(staged)
    }

    /// Add to a counter without batch semantics. Used while rebuilding.
    pub(crate) fn increment(&mut self, key: CounterKey) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    /// Current count for a key; zero when nothing was observed.
    pub fn read(&self, key: CounterKey) -> i64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    /// Entries in key order.
    pub fn snapshot(&self) -> impl Iterator<Item = (CounterKey, i64)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }

    /// Number of non-zero counters.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenId;

    const ALIEN: TokenId = TokenId(0);
    const HUMAN: TokenId = TokenId(1);

    fn batch(entries: &[(CounterKey, i64)]) -> DeltaBatch {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_absent_key_reads_zero() {
        let table = CounterTable::new();
        assert_eq!(table.read(CounterKey::nodes()), 0);
        assert_eq!(table.read(CounterKey::label(ALIEN)), 0);
    }

    #[test]
    fn test_apply_batch() {
        let mut table = CounterTable::new();
        table
            .apply(&batch(&[
                (CounterKey::nodes(), 2),
                (CounterKey::label(ALIEN), 1),
                (CounterKey::label(HUMAN), 1),
            ]))
            .unwrap();

        assert_eq!(table.read(CounterKey::nodes()), 2);
        assert_eq!(table.read(CounterKey::label(ALIEN)), 1);
        assert_eq!(table.read(CounterKey::label(HUMAN)), 1);
    }

    #[test]
    fn test_negative_count_leaves_table_unchanged() {
        let mut table = CounterTable::new();
        table
            .apply(&batch(&[(CounterKey::nodes(), 1), (CounterKey::label(ALIEN), 1)]))
            .unwrap();
        let before = table.clone();

        // First delta is fine on its own, second one is not
        let result = table.apply(&batch(&[
            (CounterKey::nodes(), -1),
            (CounterKey::label(HUMAN), -1),
        ]));

        assert!(matches!(
            result,
            Err(CountsError::NegativeCount { key, current: 0, delta: -1 }) if key == CounterKey::label(HUMAN)
        ));
        assert_eq!(table, before);
    }

    #[test]
    fn test_repeated_key_within_batch() {
        let mut table = CounterTable::new();
        table.apply(&batch(&[(CounterKey::nodes(), 1)])).unwrap();

        // +2 then -4 on a count of 1 goes negative only once both are applied
        let result = table.apply(&batch(&[(CounterKey::nodes(), 2), (CounterKey::nodes(), -4)]));
        assert!(matches!(result, Err(CountsError::NegativeCount { current: 3, .. })));
        assert_eq!(table.read(CounterKey::nodes()), 1);

        // +2 then -3 lands exactly on zero
        table
            .apply(&batch(&[(CounterKey::nodes(), 2), (CounterKey::nodes(), -3)]))
            .unwrap();
        assert_eq!(table.read(CounterKey::nodes()), 0);
    }

    #[test]
    fn test_zero_counts_are_dropped() {
        let mut table = CounterTable::new();
        table.apply(&batch(&[(CounterKey::label(ALIEN), 1)])).unwrap();
        table.apply(&batch(&[(CounterKey::label(ALIEN), -1)])).unwrap();

        assert!(table.is_empty());
        assert_eq!(table, CounterTable::new());
    }

    #[test]
    fn test_overflow_rejected() {
        let mut table = CounterTable::from_entries([(CounterKey::nodes(), i64::MAX)]).unwrap();
        let result = table.apply(&batch(&[(CounterKey::nodes(), 1)]));
        assert!(matches!(result, Err(CountsError::CountOverflow { .. })));
        assert_eq!(table.read(CounterKey::nodes()), i64::MAX);
    }

    #[test]
    fn test_snapshot_is_sorted_and_restartable() {
        let table = CounterTable::from_entries([
            (CounterKey::label(HUMAN), 16),
            (CounterKey::nodes(), 32),
            (CounterKey::label(ALIEN), 16),
        ])
        .unwrap();

        let first: Vec<_> = table.snapshot().collect();
        let second: Vec<_> = table.snapshot().collect();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                (CounterKey::nodes(), 32),
                (CounterKey::label(ALIEN), 16),
                (CounterKey::label(HUMAN), 16),
            ]
        );
    }

    #[test]
    fn test_from_entries_rejects_duplicates() {
        let result = CounterTable::from_entries([(CounterKey::nodes(), 1), (CounterKey::nodes(), 2)]);
        assert!(matches!(result, Err(CountsError::InvalidFormat(_))));
    }
}
