use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::comparer::SharedComparer;
use crate::record::VersionedRecord;

/// The versions a component holds for one key.
#[derive(Debug, Clone)]
pub struct DifferentialVersions {
    pub current: Arc<VersionedRecord>,
    pub previous: Option<Arc<VersionedRecord>>,
}

/// A version pushed out of a component, together with the version that
/// superseded it.
#[derive(Debug, Clone)]
pub struct RetiredPair {
    pub retired: Arc<VersionedRecord>,
    pub next: Arc<VersionedRecord>,
}

struct Inner {
    index: HashMap<Vec<u8>, usize>,
    entries: Vec<(Vec<u8>, DifferentialVersions)>,
    frozen: bool,
}

/// Buffer of the one or two newest versions per key written since the
/// component was created.
pub struct DifferentialComponent {
    comparer: SharedComparer,
    inner: RwLock<Inner>,
}

impl DifferentialComponent {
    pub fn new(comparer: SharedComparer) -> Self {
        Self {
            comparer,
            inner: RwLock::new(Inner {
                index: HashMap::new(),
                entries: Vec::new(),
                frozen: false,
            }),
        }
    }

    pub fn comparer(&self) -> &SharedComparer {
        &self.comparer
    }

    /// Installs `record` as the current version of `key`.
    ///
    /// # Panics
    /// If the component is frozen, or if `record` is not newer than the
    /// key's current version. Both indicate a corrupted apply stream.
    pub fn add(&self, key: &[u8], record: Arc<VersionedRecord>) -> Option<RetiredPair> {
        let mut inner = self.inner.write();
        if inner.frozen {
            tracing::error!(seq = record.seq(), "write to a frozen differential component");
            panic!("write to a frozen differential component");
        }

        let slot = inner.index.get(key).copied();
        match slot {
            None => {
                let pos = inner.entries.len();
                inner.entries.push((
                    key.to_vec(),
                    DifferentialVersions {
                        current: record,
                        previous: None,
                    },
                ));
                inner.index.insert(key.to_vec(), pos);
                None
            }
            Some(pos) => {
                let versions = &mut inner.entries[pos].1;
                if record.seq() <= versions.current.seq() {
                    tracing::error!(
                        new_seq = record.seq(),
                        current_seq = versions.current.seq(),
                        "sequence numbers must increase per key"
                    );
                    panic!(
                        "sequence number {} is not newer than {}",
                        record.seq(),
                        versions.current.seq()
                    );
                }
                let old_current = std::mem::replace(&mut versions.current, record);
                let evicted = versions.previous.replace(old_current.clone());
                evicted.map(|retired| RetiredPair {
                    retired,
                    next: old_current,
                })
            }
        }
    }

    /// Current version of `key`.
    pub fn read(&self, key: &[u8]) -> Option<Arc<VersionedRecord>> {
        let inner = self.inner.read();
        inner
            .index
            .get(key)
            .map(|&pos| inner.entries[pos].1.current.clone())
    }

    pub fn read_versions(&self, key: &[u8]) -> Option<DifferentialVersions> {
        let inner = self.inner.read();
        inner
            .index
            .get(key)
            .map(|&pos| inner.entries[pos].1.clone())
    }

    /// Newest version of `key` visible at `visibility_lsn`.
    pub fn read_at(&self, key: &[u8], visibility_lsn: u64) -> Option<Arc<VersionedRecord>> {
        let versions = self.read_versions(key)?;
        if versions.current.seq() <= visibility_lsn {
            return Some(versions.current);
        }
        versions.previous.filter(|p| p.seq() <= visibility_lsn)
    }

    /// Drops the previous version of `key` if it is still the one with
    /// sequence number `seq`. Returns whether anything was dropped.
    ///
    /// Callers read the pair with [`read_versions`](Self::read_versions),
    /// hand the previous version to whoever keeps it for snapshot readers,
    /// and only then clear it here, so a reader always finds it in one of
    /// the two places.
    pub fn clear_previous(&self, key: &[u8], seq: u64) -> bool {
        let mut inner = self.inner.write();
        let Some(&pos) = inner.index.get(key) else {
            return false;
        };
        let versions = &mut inner.entries[pos].1;
        if versions.previous.as_ref().map(|p| p.seq()) != Some(seq) {
            return false;
        }
        versions.previous = None;
        true
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.inner.read().index.contains_key(key)
    }

    /// Orders the entries and freezes the component.
    pub fn sort(&self) {
        let mut inner = self.inner.write();
        let comparer = self.comparer.clone();
        inner
            .entries
            .sort_by(|a, b| comparer.compare(&a.0, &b.0));
        let reindexed: HashMap<Vec<u8>, usize> = inner
            .entries
            .iter()
            .enumerate()
            .map(|(pos, (k, _))| (k.clone(), pos))
            .collect();
        inner.index = reindexed;
        inner.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.read().frozen
    }

    /// Entries in key order.
    pub fn iter(&self) -> std::vec::IntoIter<(Vec<u8>, DifferentialVersions)> {
        let inner = self.inner.read();
        let mut entries = inner.entries.clone();
        if !inner.frozen {
            entries.sort_by(|a, b| self.comparer.compare(&a.0, &b.0));
        }
        entries.into_iter()
    }

    /// Keys in key order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.iter().map(|(k, _)| k).collect()
    }

    /// Smallest key strictly greater than `key`.
    pub fn read_next(&self, key: &[u8]) -> Option<(Vec<u8>, Arc<VersionedRecord>)> {
        let inner = self.inner.read();
        if inner.frozen {
            let start = inner
                .entries
                .partition_point(|(k, _)| self.comparer.compare(k, key) != Ordering::Greater);
            return inner
                .entries
                .get(start)
                .map(|(k, v)| (k.clone(), v.current.clone()));
        }
        inner
            .entries
            .iter()
            .filter(|(k, _)| self.comparer.compare(k, key) == Ordering::Greater)
            .min_by(|a, b| self.comparer.compare(&a.0, &b.0))
            .map(|(k, v)| (k.clone(), v.current.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Every record this component holds, candidates for value eviction.
    pub fn values_for_sweep(&self) -> Vec<Arc<VersionedRecord>> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.entries.len());
        for (_, versions) in &inner.entries {
            out.push(versions.current.clone());
            if let Some(previous) = &versions.previous {
                out.push(previous.clone());
            }
        }
        out
    }
}

impl fmt::Debug for DifferentialComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("DifferentialComponent")
            .field("len", &inner.entries.len())
            .field("frozen", &inner.frozen)
            .finish()
    }
}
