use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use checkpoint::{CheckpointFile, IoPriority};
use config::{MergePolicy, StoreConfig};
use crossbeam_channel::{bounded, Sender};
use differential::{bytewise, VersionedRecord};
use parking_lot::Mutex;

use crate::*;

/// Inline consolidation after every checkpoint, no sweep, no merges.
pub fn test_config(dir: &Path) -> StoreConfig {
    let mut config = StoreConfig::new(dir);
    config.trace_type = "test".to_string();
    config.number_of_deltas_to_be_consolidated = 1;
    config.enable_background_consolidation = false;
    config.enable_sweep = false;
    config.merge.policy = MergePolicy::NONE;
    config
}

pub fn open_store(dir: &Path) -> Result<Store> {
    Ok(Store::open(test_config(dir), Arc::new(AlwaysRemovable))?)
}

pub fn open_with(config: StoreConfig) -> Result<Store> {
    Ok(Store::open(config, Arc::new(AlwaysRemovable))?)
}

/// Prepare, perform and complete in one go.
pub fn checkpoint(store: &Store, lsn: u64) -> Result<()> {
    store.prepare_checkpoint(lsn)?;
    store.perform_checkpoint(&CancellationToken::new())?;
    store.complete_checkpoint()?;
    Ok(())
}

pub fn value(store: &Store, key: &[u8]) -> Option<Vec<u8>> {
    store.get(key).unwrap().map(|v| v.to_vec())
}

pub fn value_at(store: &Store, key: &[u8], lsn: u64) -> Option<Vec<u8>> {
    store.get_at(key, lsn).unwrap().map(|v| v.to_vec())
}

pub fn key_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| name.ends_with(".sdk"))
        .collect();
    names.sort();
    names
}

pub fn rec(seq: u64, v: &str) -> Arc<VersionedRecord> {
    Arc::new(VersionedRecord::updated(seq, v.as_bytes().to_vec()))
}

pub fn tombstone(seq: u64) -> Arc<VersionedRecord> {
    Arc::new(VersionedRecord::deleted(seq))
}

/// Writes `(key, value-or-tombstone, seq)` triples as a checkpoint file.
pub fn write_file(
    dir: &Path,
    file_id: u32,
    timestamp: u64,
    entries: &[(&[u8], Option<&str>, u64)],
) -> Result<CheckpointFile> {
    let items: Vec<(Vec<u8>, Arc<VersionedRecord>)> = entries
        .iter()
        .map(|&(k, v, seq)| {
            let record = match v {
                Some(v) => rec(seq, v),
                None => tombstone(seq),
            };
            (k.to_vec(), record)
        })
        .collect();
    Ok(CheckpointFile::create(
        dir,
        &format!("ckpt-{:010}", file_id),
        file_id,
        timestamp,
        items.len(),
        bytewise(),
        IoPriority::Normal,
        items,
    )?)
}

type QueryHook = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Version manager that records every query and, while readers are
/// registered, keeps each version visible to them.
#[derive(Default)]
pub struct RecordingVersionManager {
    readers: Mutex<BTreeSet<u64>>,
    calls: Mutex<Vec<(u64, u64)>>,
    done: Mutex<Vec<Sender<()>>>,
    on_query: Mutex<Option<QueryHook>>,
}

impl RecordingVersionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_reader(&self, visibility_lsn: u64) {
        self.readers.lock().insert(visibility_lsn);
    }

    /// `(deleted_seq, next_seq)` for every query so far.
    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().clone()
    }

    /// Runs `hook(deleted_seq, next_seq)` at the start of every query.
    pub fn set_on_query(&self, hook: Option<QueryHook>) {
        *self.on_query.lock() = hook;
    }

    /// Signals every outstanding completion and forgets the readers.
    pub fn finish_readers(&self) {
        self.readers.lock().clear();
        for tx in self.done.lock().drain(..) {
            let _ = tx.send(());
        }
    }
}

impl VersionManager for RecordingVersionManager {
    fn try_remove_version(&self, _: u64, deleted_seq: u64, next_seq: u64) -> TryRemoveVersionResult {
        if let Some(hook) = self.on_query.lock().as_ref() {
            hook(deleted_seq, next_seq);
        }
        self.calls.lock().push((deleted_seq, next_seq));
        let needed: BTreeSet<u64> = self
            .readers
            .lock()
            .iter()
            .copied()
            .filter(|&lsn| deleted_seq <= lsn && lsn < next_seq)
            .collect();
        if needed.is_empty() {
            return TryRemoveVersionResult::removable();
        }
        let mut notifications = Vec::with_capacity(needed.len());
        for &lsn in &needed {
            let (tx, rx) = bounded(1);
            self.done.lock().push(tx);
            notifications.push((lsn, rx));
        }
        TryRemoveVersionResult {
            can_be_removed: false,
            enumeration_set: needed,
            completion_notifications: notifications,
        }
    }
}

/// Polls `condition` for up to two seconds.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    false
}
