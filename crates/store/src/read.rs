//! Read path.
//!
//! ```text
//!   get(k)           differential ─► delta N ─► ... ─► consolidated
//!   get_at(k, lsn)   differential ─► snapshot[lsn] ─► deltas ─► consolidated
//! ```
//!
//! The snapshot container is consulted before the delta chain because the
//! highest delta gives up its previous versions to it during consolidation.
//!
//! A record whose value was swept is reloaded from its checkpoint file.
//! The reader marks the record in use first so a concurrent sweep leaves
//! it alone for one cycle.

use std::cmp::Ordering;
use std::sync::Arc;

use differential::{ValueLocation, VersionedRecord};

use crate::error::{Result, StoreError};
use crate::metadata::TablePin;
use crate::Store;

const PIN_ATTEMPTS: usize = 3;
const LOAD_ATTEMPTS: usize = 3;

impl Store {
    /// Newest record for `key`, tombstones included.
    pub(crate) fn read_record(&self, key: &[u8]) -> Option<Arc<VersionedRecord>> {
        self.differential
            .load()
            .read(key)
            .or_else(|| self.manager.read(key))
    }

    pub(crate) fn read_record_at(&self, key: &[u8], lsn: u64) -> Option<Arc<VersionedRecord>> {
        self.differential
            .load()
            .read_at(key, lsn)
            .or_else(|| self.snapshots.read_at(key, lsn))
            .or_else(|| self.manager.read_at(key, lsn))
    }

    /// Current value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Arc<[u8]>>> {
        self.ensure_open()?;
        self.resolve(|| self.read_record(key))
    }

    /// Value of `key` as a reader pinned at `visibility_lsn` sees it.
    pub fn get_at(&self, key: &[u8], visibility_lsn: u64) -> Result<Option<Arc<[u8]>>> {
        self.ensure_open()?;
        self.resolve(|| self.read_record_at(key, visibility_lsn))
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.read_record(key).map_or(false, |r| !r.is_deleted())
    }

    /// Smallest live key strictly greater than `key`, with its value.
    pub fn read_next(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Arc<[u8]>)>> {
        self.ensure_open()?;
        let comparer = self.ctx.comparer.clone();
        let mut cursor = key.to_vec();
        loop {
            let from_differential = self.differential.load().read_next(&cursor).map(|(k, _)| k);
            let from_aggregated = self.manager.read_next(&cursor).map(|(k, _)| k);
            let candidate = match (from_differential, from_aggregated) {
                (None, None) => return Ok(None),
                (Some(k), None) | (None, Some(k)) => k,
                (Some(a), Some(b)) => match comparer.compare(&a, &b) {
                    Ordering::Greater => b,
                    _ => a,
                },
            };
            if let Some(value) = self.resolve(|| self.read_record(&candidate))? {
                return Ok(Some((candidate, value)));
            }
            cursor = candidate;
        }
    }

    /// Every live key, in key order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let comparer = self.ctx.comparer.clone();
        let mut keys = self.manager.enumerate_keys();
        keys.extend(self.differential.load().keys());
        keys.sort_by(|a, b| comparer.compare(a, b));
        keys.dedup_by(|a, b| comparer.compare(a, b) == Ordering::Equal);
        keys.retain(|k| self.contains_key(k));
        keys
    }

    /// Number of live keys.
    pub fn count(&self) -> i64 {
        self.count.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Looks the record up and loads its value. A file merged away between
    /// lookup and load sends the reader back for the relocated record.
    fn resolve<F>(&self, lookup: F) -> Result<Option<Arc<[u8]>>>
    where
        F: Fn() -> Option<Arc<VersionedRecord>>,
    {
        let mut last_error = None;
        for _ in 0..LOAD_ATTEMPTS {
            let Some(record) = lookup() else {
                return Ok(None);
            };
            if record.is_deleted() {
                return Ok(None);
            }
            match self.load_value(&record) {
                Ok(value) => return Ok(Some(value)),
                Err(StoreError::Metadata(reason)) => {
                    tracing::debug!(trace_type = self.trace_type(), %reason, "retrying value load");
                    last_error = Some(StoreError::Metadata(reason));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| StoreError::Metadata("value load failed".into())))
    }

    /// The record's value, reloaded from disk if it was swept.
    pub(crate) fn load_value(&self, record: &VersionedRecord) -> Result<Arc<[u8]>> {
        if let Some(value) = record.value() {
            return Ok(value);
        }
        record.mark_in_use();
        if let Some(value) = record.value() {
            return Ok(value);
        }
        let location = record.location();
        crate::store_assert!(
            location.file_id != 0,
            "live record seq {} has neither a value nor a file",
            record.seq()
        );
        let value = self.read_from_file(location)?;
        record.set_value(Arc::clone(&value));
        Ok(value)
    }

    /// Reads a value through whichever metadata table lists its file.
    fn read_from_file(&self, location: ValueLocation) -> Result<Arc<[u8]>> {
        for _ in 0..PIN_ATTEMPTS {
            let (pins, complete) = self.pin_tables();
            for pin in &pins {
                if let Some(file) = pin.get(location.file_id) {
                    return Ok(file.file().read_value(location)?);
                }
            }
            if complete {
                break;
            }
        }
        // Files pinned only by snapshot readers are no longer in any table.
        if let Some(file) = self.ctx.arena.get(location.file_id) {
            return Ok(file.file().read_value(location)?);
        }
        Err(StoreError::Metadata(format!(
            "file {} is not referenced by any metadata table",
            location.file_id
        )))
    }

    /// Pins the current, next and merge tables. The flag is `false` when a
    /// table was released between load and pin.
    fn pin_tables(&self) -> (Vec<TablePin>, bool) {
        let tables = [
            Some(self.current_table.load_full()),
            self.next_table.load_full(),
            self.ctx.merge_table.load_full(),
        ];
        let mut pins = Vec::with_capacity(tables.len());
        let mut complete = true;
        for table in tables.into_iter().flatten() {
            match table.pin() {
                Some(pin) => pins.push(pin),
                None => complete = false,
            }
        }
        (pins, complete)
    }
}
