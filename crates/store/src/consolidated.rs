use std::cmp::Ordering;
use std::sync::Arc;

use differential::{SharedComparer, VersionedRecord};
use parking_lot::RwLock;

use crate::store_assert;

/// The base snapshot: one record per key, sorted.
///
/// Built once per consolidation, in key order, then published and never
/// changed again. [`update`](Self::update) is only used while a file merge
/// relocates records and the component is still private to the
/// consolidation.
pub struct ConsolidatedComponent {
    comparer: SharedComparer,
    entries: RwLock<Vec<(Vec<u8>, Arc<VersionedRecord>)>>,
}

impl ConsolidatedComponent {
    pub fn new(comparer: SharedComparer) -> Self {
        Self {
            comparer,
            entries: RwLock::new(Vec::new()),
        }
    }

    fn search(&self, entries: &[(Vec<u8>, Arc<VersionedRecord>)], key: &[u8]) -> Result<usize, usize> {
        entries.binary_search_by(|(k, _)| self.comparer.compare(k, key))
    }

    /// Inserts a key that is not yet present. Appending in key order is
    /// the fast path; anything else is placed by binary search.
    pub fn add(&self, key: &[u8], record: Arc<VersionedRecord>) {
        let mut entries = self.entries.write();
        let appends = entries
            .last()
            .map_or(true, |(last, _)| self.comparer.compare(last, key) == Ordering::Less);
        if appends {
            entries.push((key.to_vec(), record));
            return;
        }
        match self.search(&entries, key) {
            Ok(_) => {
                store_assert!(false, "key added twice to a consolidated component");
            }
            Err(pos) => entries.insert(pos, (key.to_vec(), record)),
        }
    }

    /// Replaces the record of an existing key.
    pub fn update(&self, key: &[u8], record: Arc<VersionedRecord>) {
        let mut entries = self.entries.write();
        let found = self.search(&entries, key);
        store_assert!(found.is_ok(), "update of a key missing from the consolidated component");
        if let Ok(pos) = found {
            entries[pos].1 = record;
        }
    }

    pub fn read(&self, key: &[u8]) -> Option<Arc<VersionedRecord>> {
        let entries = self.entries.read();
        self.search(&entries, key)
            .ok()
            .map(|pos| Arc::clone(&entries[pos].1))
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        let entries = self.entries.read();
        self.search(&entries, key).is_ok()
    }

    /// Smallest key strictly greater than `key`.
    pub fn read_next(&self, key: &[u8]) -> Option<(Vec<u8>, Arc<VersionedRecord>)> {
        let entries = self.entries.read();
        let start = entries.partition_point(|(k, _)| self.comparer.compare(k, key) != Ordering::Greater);
        entries
            .get(start)
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.entries.read().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Arc<VersionedRecord>> {
        self.entries
            .read()
            .iter()
            .map(|(_, v)| Arc::clone(v))
            .collect()
    }

    /// Entries in key order.
    pub fn iter(&self) -> std::vec::IntoIter<(Vec<u8>, Arc<VersionedRecord>)> {
        self.entries.read().clone().into_iter()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn comparer(&self) -> &SharedComparer {
        &self.comparer
    }
}

impl std::fmt::Debug for ConsolidatedComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidatedComponent")
            .field("len", &self.len())
            .finish()
    }
}
