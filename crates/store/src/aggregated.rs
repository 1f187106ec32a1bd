use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use differential::{DifferentialComponent, SharedComparer, VersionedRecord};

use crate::consolidated::ConsolidatedComponent;

/// Everything checkpointed since the store opened: a chain of frozen deltas
/// on top of a consolidated base.
///
/// ```text
///   read(k):  delta[index] -> ... -> delta[1] -> consolidated
///             newest                             oldest
/// ```
///
/// Published through an `ArcSwap`; a published state is never modified.
/// Appending a delta clones the (short) chain into a new state.
#[derive(Clone)]
pub struct AggregatedState {
    index: u32,
    deltas: BTreeMap<u32, Arc<DifferentialComponent>>,
    consolidated: Arc<ConsolidatedComponent>,
}

impl AggregatedState {
    pub fn new(consolidated: Arc<ConsolidatedComponent>) -> Self {
        Self {
            index: 0,
            deltas: BTreeMap::new(),
            consolidated,
        }
    }

    pub fn empty(comparer: SharedComparer) -> Self {
        Self::new(Arc::new(ConsolidatedComponent::new(comparer)))
    }

    /// Number of deltas chained so far.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn append_delta(&mut self, delta: Arc<DifferentialComponent>) {
        self.index += 1;
        self.deltas.insert(self.index, delta);
    }

    pub fn delta(&self, index: u32) -> Option<&Arc<DifferentialComponent>> {
        self.deltas.get(&index)
    }

    /// Deltas from `1` up to `highest`, oldest first.
    pub fn deltas_up_to(&self, highest: u32) -> impl Iterator<Item = (u32, &Arc<DifferentialComponent>)> {
        self.deltas.range(1..=highest).map(|(i, d)| (*i, d))
    }

    pub fn consolidated(&self) -> &Arc<ConsolidatedComponent> {
        &self.consolidated
    }

    fn comparer(&self) -> &SharedComparer {
        self.consolidated.comparer()
    }

    /// Newest record for `key`, tombstones included.
    pub fn read(&self, key: &[u8]) -> Option<Arc<VersionedRecord>> {
        for delta in self.deltas.values().rev() {
            if let Some(record) = delta.read(key) {
                return Some(record);
            }
        }
        self.consolidated.read(key)
    }

    /// Newest delta record for `key` visible at `lsn`.
    ///
    /// The consolidated base is not consulted: versions it has superseded
    /// live in the snapshot container, which the caller checks first.
    pub fn read_deltas_at(&self, key: &[u8], lsn: u64) -> Option<Arc<VersionedRecord>> {
        self.deltas
            .values()
            .rev()
            .find_map(|delta| delta.read_at(key, lsn))
    }

    /// Newest record for `key` visible at `lsn`, from deltas or base.
    pub fn read_at(&self, key: &[u8], lsn: u64) -> Option<Arc<VersionedRecord>> {
        self.read_deltas_at(key, lsn).or_else(|| {
            self.consolidated
                .read(key)
                .filter(|record| record.seq() <= lsn)
        })
    }

    /// Smallest live key strictly greater than `key`.
    pub fn read_next(&self, key: &[u8]) -> Option<(Vec<u8>, Arc<VersionedRecord>)> {
        let mut cursor = key.to_vec();
        loop {
            let candidate = self
                .deltas
                .values()
                .filter_map(|d| d.read_next(&cursor).map(|(k, _)| k))
                .chain(self.consolidated.read_next(&cursor).map(|(k, _)| k))
                .min_by(|a, b| self.comparer().compare(a, b))?;
            match self.read(&candidate) {
                Some(record) if !record.is_deleted() => return Some((candidate, record)),
                _ => cursor = candidate,
            }
        }
    }

    /// Every live key in key order.
    pub fn enumerate_keys(&self) -> Vec<Vec<u8>> {
        let mut keys = self.consolidated.keys();
        for delta in self.deltas.values() {
            keys.extend(delta.keys());
        }
        let comparer = self.comparer().clone();
        keys.sort_by(|a, b| comparer.compare(a, b));
        keys.dedup_by(|a, b| comparer.compare(a, b) == Ordering::Equal);
        keys.retain(|k| self.read(k).map_or(false, |r| !r.is_deleted()));
        keys
    }

    pub fn count(&self) -> usize {
        self.enumerate_keys().len()
    }

    /// Records whose in-memory value may be evicted.
    pub fn values_for_sweep(&self) -> Vec<Arc<VersionedRecord>> {
        let mut values = self.consolidated.values();
        for delta in self.deltas.values() {
            values.extend(delta.values_for_sweep());
        }
        values
    }
}

impl std::fmt::Debug for AggregatedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatedState")
            .field("index", &self.index)
            .field("deltas", &self.deltas.keys().collect::<Vec<_>>())
            .field("consolidated", &self.consolidated.len())
            .finish()
    }
}
