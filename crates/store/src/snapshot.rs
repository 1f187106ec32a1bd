//! Retired versions kept alive for snapshot readers.
//!
//! When version retirement is told that readers pinned at some visibility
//! sequence number still need a version, the version is copied into the
//! [`SnapshotContainer`] under that number. The [`SnapshotReaper`] thread
//! drops the entry once the version manager signals that those readers
//! are done.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use differential::VersionedRecord;
use parking_lot::{Mutex, RwLock};

use crate::metadata::{FileArena, FileHolder};

/// Versions visible at one visibility sequence number.
#[derive(Debug)]
pub struct SnapshotComponent {
    lsn: u64,
    records: RwLock<HashMap<Vec<u8>, Arc<VersionedRecord>>>,
    files: Mutex<HashSet<u32>>,
}

impl SnapshotComponent {
    fn new(lsn: u64) -> Self {
        Self {
            lsn,
            records: RwLock::new(HashMap::new()),
            files: Mutex::new(HashSet::new()),
        }
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    /// Keeps the newest version of `key` that is still visible at this
    /// component's sequence number.
    pub fn add(&self, key: &[u8], record: Arc<VersionedRecord>) {
        if record.seq() > self.lsn {
            return;
        }
        let mut records = self.records.write();
        match records.get(key) {
            Some(existing) if existing.seq() >= record.seq() => {}
            _ => {
                records.insert(key.to_vec(), record);
            }
        }
    }

    pub fn read(&self, key: &[u8]) -> Option<Arc<VersionedRecord>> {
        self.records.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn file_ids(&self) -> Vec<u32> {
        self.files.lock().iter().copied().collect()
    }
}

#[derive(Default)]
struct Entries {
    components: HashMap<u64, Arc<SnapshotComponent>>,
    /// Completion notifications registered with the reaper and not yet
    /// fired, per visibility sequence number.
    watches: HashMap<u64, usize>,
}

/// Visibility sequence number → [`SnapshotComponent`].
///
/// An entry created by [`preserve`](Self::preserve) always has a pending
/// watch, so the reaper is guaranteed to drop it and its file holds.
pub struct SnapshotContainer {
    arena: Arc<FileArena>,
    entries: RwLock<Entries>,
}

impl SnapshotContainer {
    pub fn new(arena: Arc<FileArena>) -> Self {
        Self {
            arena,
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn read(&self, lsn: u64) -> Option<Arc<SnapshotComponent>> {
        self.entries.read().components.get(&lsn).cloned()
    }

    pub fn get_or_add(&self, lsn: u64) -> Arc<SnapshotComponent> {
        if let Some(existing) = self.read(lsn) {
            return existing;
        }
        Arc::clone(
            self.entries
                .write()
                .components
                .entry(lsn)
                .or_insert_with(|| Arc::new(SnapshotComponent::new(lsn))),
        )
    }

    /// Keeps `file_id` on disk for as long as the entry for `lsn` exists.
    /// Returns `false` if the file was already held by this entry or the
    /// entry does not exist.
    pub fn try_add_file(&self, lsn: u64, file_id: u32) -> bool {
        let Some(component) = self.read(lsn) else {
            return false;
        };
        self.hold_file(&component, file_id)
    }

    fn hold_file(&self, component: &SnapshotComponent, file_id: u32) -> bool {
        let lsn = component.lsn;
        let mut files = component.files.lock();
        if files.contains(&file_id) {
            return false;
        }
        if !self.arena.hold_id(file_id, FileHolder::Snapshot(lsn)) {
            tracing::warn!(lsn, file_id, "snapshot references a file that is no longer open");
            return false;
        }
        files.insert(file_id);
        true
    }

    /// Notes that a completion notification for `lsn` is on its way to the
    /// reaper. Must happen before the versions it covers are preserved.
    pub fn register_watch(&self, lsn: u64) {
        *self.entries.write().watches.entry(lsn).or_insert(0) += 1;
    }

    pub fn pending_watches(&self, lsn: u64) -> usize {
        self.entries.read().watches.get(&lsn).copied().unwrap_or(0)
    }

    /// Keeps `version` of `key` (and its file) for readers at `lsn`.
    ///
    /// Refused, returning `false`, when no watch is pending for `lsn`: the
    /// entry could never be reaped.
    pub fn preserve(&self, lsn: u64, key: &[u8], version: &Arc<VersionedRecord>) -> bool {
        let mut entries = self.entries.write();
        if entries.watches.get(&lsn).copied().unwrap_or(0) == 0 {
            return false;
        }
        let component = Arc::clone(
            entries
                .components
                .entry(lsn)
                .or_insert_with(|| Arc::new(SnapshotComponent::new(lsn))),
        );
        let file_id = version.file_id();
        if file_id != 0 {
            self.hold_file(&component, file_id);
        }
        component.add(key, Arc::clone(version));
        true
    }

    /// Called by the reaper when one watch for `lsn` fires. The entry goes
    /// once its last watch has fired.
    fn complete_watch(&self, lsn: u64) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let pending = entries.watches.get(&lsn).copied().unwrap_or(0);
            if pending > 1 {
                entries.watches.insert(lsn, pending - 1);
                return false;
            }
            entries.watches.remove(&lsn);
            entries.components.remove(&lsn)
        };
        self.release(lsn, removed)
    }

    /// Drops the entry for `lsn` and releases the files it held.
    pub fn remove(&self, lsn: u64) -> bool {
        let removed = self.entries.write().components.remove(&lsn);
        self.release(lsn, removed)
    }

    fn release(&self, lsn: u64, removed: Option<Arc<SnapshotComponent>>) -> bool {
        match removed {
            Some(component) => {
                for file_id in component.file_ids() {
                    self.arena.release(file_id, FileHolder::Snapshot(lsn));
                }
                true
            }
            None => false,
        }
    }

    /// The version of `key` retained for readers at `lsn`.
    pub fn read_at(&self, key: &[u8], lsn: u64) -> Option<Arc<VersionedRecord>> {
        self.read(lsn)?.read(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().components.is_empty()
    }

    /// Drops every entry. Pending watches stay counted until they fire.
    pub fn clear(&self) {
        let lsns: Vec<u64> = self.entries.read().components.keys().copied().collect();
        for lsn in lsns {
            self.remove(lsn);
        }
    }
}

impl std::fmt::Debug for SnapshotContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotContainer")
            .field("entries", &self.len())
            .finish()
    }
}

pub(crate) enum ReaperMessage {
    Watch { lsn: u64, done: Receiver<()> },
    Shutdown,
}

/// Removes snapshot entries when their readers complete.
///
/// A completion fires when its sender sends or is dropped; either way the
/// entry goes. Nothing the reaper does can fail the store: a missing
/// entry is logged and skipped.
pub struct SnapshotReaper {
    container: Arc<SnapshotContainer>,
    tx: Sender<ReaperMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SnapshotReaper {
    pub fn spawn(container: Arc<SnapshotContainer>, trace_type: String) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let reaped = Arc::clone(&container);
        let handle = std::thread::Builder::new()
            .name("tstore-snapshot-reaper".into())
            .spawn(move || run_reaper(rx, reaped, trace_type))?;
        Ok(Self {
            container,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Registers a completion notification for the entry at `lsn`.
    pub fn watch(&self, lsn: u64, done: Receiver<()>) {
        self.container.register_watch(lsn);
        send_watch(&self.tx, lsn, done);
    }

    pub(crate) fn sender(&self) -> Sender<ReaperMessage> {
        self.tx.clone()
    }

    /// Stops the reaper thread and waits for it.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.tx.send(ReaperMessage::Shutdown);
        if handle.join().is_err() {
            tracing::error!("snapshot reaper thread panicked");
        }
    }
}

impl Drop for SnapshotReaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) fn send_watch(tx: &Sender<ReaperMessage>, lsn: u64, done: Receiver<()>) {
    if tx.send(ReaperMessage::Watch { lsn, done }).is_err() {
        tracing::warn!(lsn, "snapshot reaper is stopped; entry will stay until close");
    }
}

enum ReaperEvent {
    Registered(u64, Receiver<()>),
    Fired(usize),
    Stop,
}

fn run_reaper(control: Receiver<ReaperMessage>, container: Arc<SnapshotContainer>, trace_type: String) {
    let mut watches: Vec<(u64, Receiver<()>)> = Vec::new();

    loop {
        let event = {
            let mut sel = Select::new();
            sel.recv(&control);
            for (_, done) in &watches {
                sel.recv(done);
            }
            let oper = sel.select();
            let index = oper.index();
            if index == 0 {
                match oper.recv(&control) {
                    Ok(ReaperMessage::Watch { lsn, done }) => ReaperEvent::Registered(lsn, done),
                    Ok(ReaperMessage::Shutdown) | Err(_) => ReaperEvent::Stop,
                }
            } else {
                // A dropped sender counts as completion.
                let _ = oper.recv(&watches[index - 1].1);
                ReaperEvent::Fired(index - 1)
            }
        };

        match event {
            ReaperEvent::Registered(lsn, done) => watches.push((lsn, done)),
            ReaperEvent::Fired(slot) => {
                let (lsn, _) = watches.swap_remove(slot);
                if container.complete_watch(lsn) {
                    tracing::debug!(trace_type = %trace_type, lsn, "removed snapshot entry");
                } else {
                    tracing::debug!(trace_type = %trace_type, lsn, "snapshot entry kept or already gone");
                }
            }
            ReaperEvent::Stop => break,
        }
    }
    tracing::debug!(trace_type = %trace_type, pending = watches.len(), "snapshot reaper stopped");
}
