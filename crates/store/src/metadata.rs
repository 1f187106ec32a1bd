//! File lifecycle: [`FileMetadata`], [`MetadataTable`] and the [`FileArena`].
//!
//! Every open checkpoint file lives in the arena together with the set of
//! things that currently hold it:
//!
//! ```text
//!   FileArena
//!   ┌─────────┬───────────────────────────────────────────┐
//!   │ file 3  │ Table(gen 7)  Table(gen 8)                │  current + next
//!   │ file 4  │ Table(gen 7)  Snapshot(lsn 120)           │  pinned by a reader
//!   │ file 5  │ PendingDelete                             │  merged away
//!   └─────────┴───────────────────────────────────────────┘
//! ```
//!
//! A table generation holds its files until the table's last reference is
//! released. A file is physically deleted when it is marked
//! `can_be_deleted` and its holder set becomes empty; no caller ever
//! decrements a counter by hand.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use bloom::BloomFilter;
use checkpoint::CheckpointFile;
use differential::SharedComparer;
use parking_lot::Mutex;

use crate::metadata_manager::FileRecord;
use crate::store_assert;

const INVALID_KEY_FPR: f64 = 0.01;

/// Descriptor of one checkpoint file pair.
pub struct FileMetadata {
    file_id: u32,
    file_name: String,
    total_entries: u64,
    deleted_entries: u64,
    timestamp: u64,
    oldest_deleted_timestamp: u64,
    latest_deleted_timestamp: u64,
    invalid_entries: AtomicU64,
    invalid_keys: Mutex<BloomFilter>,
    can_be_deleted: AtomicBool,
    file: CheckpointFile,
}

impl FileMetadata {
    /// Wraps a freshly written file. Deleted-entry timestamps are 0 when
    /// the file holds no retained tombstones.
    pub fn new(file: CheckpointFile, oldest_deleted: u64, latest_deleted: u64) -> Self {
        let total = file.key_count();
        Self {
            file_id: file.file_id(),
            file_name: file.name().to_string(),
            total_entries: total,
            deleted_entries: file.deleted_key_count(),
            timestamp: file.timestamp(),
            oldest_deleted_timestamp: oldest_deleted,
            latest_deleted_timestamp: latest_deleted,
            invalid_entries: AtomicU64::new(0),
            invalid_keys: Mutex::new(BloomFilter::new(total.max(1) as usize, INVALID_KEY_FPR)),
            can_be_deleted: AtomicBool::new(false),
            file,
        }
    }

    /// Opens the file a persisted record describes and checks that the
    /// two agree.
    pub fn open(dir: &Path, record: &FileRecord, comparer: SharedComparer) -> Result<Self> {
        let file = CheckpointFile::open(dir, &record.file_name, comparer)?;
        if file.file_id() != record.file_id
            || file.key_count() != record.total_entries
            || file.deleted_key_count() != record.deleted_entries
            || file.timestamp() != record.timestamp
        {
            bail!(
                "metadata for {} does not match its key file (id {} vs {}, keys {} vs {})",
                record.file_name,
                record.file_id,
                file.file_id(),
                record.total_entries,
                file.key_count()
            );
        }
        Ok(Self::new(
            file,
            record.oldest_deleted_timestamp,
            record.latest_deleted_timestamp,
        ))
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file(&self) -> &CheckpointFile {
        &self.file
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    pub fn deleted_entries(&self) -> u64 {
        self.deleted_entries
    }

    pub fn invalid_entries(&self) -> u64 {
        self.invalid_entries.load(Ordering::Acquire)
    }

    pub fn number_of_valid_entries(&self) -> u64 {
        self.total_entries - self.invalid_entries()
    }

    /// Logical stamp of the checkpoint or merge that wrote the file.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn oldest_deleted_timestamp(&self) -> u64 {
        self.oldest_deleted_timestamp
    }

    pub fn latest_deleted_timestamp(&self) -> u64 {
        self.latest_deleted_timestamp
    }

    pub fn size_on_disk(&self) -> u64 {
        self.file.size_on_disk()
    }

    /// Records that the file's entry for `key` has been superseded.
    ///
    /// The count saturates at the file's entry count: a consolidation that
    /// failed after marking and is then retried marks the same keys again.
    /// Recovery recomputes exact counts.
    pub fn add_invalid_key(&self, key: &[u8]) {
        let total = self.total_entries;
        let saturated = self
            .invalid_entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < total).then_some(n + 1)
            })
            .is_err();
        if saturated {
            tracing::warn!(
                file_id = self.file_id,
                total,
                "invalid entry count already at total, key marked again"
            );
        }
        self.invalid_keys.lock().insert(key);
    }

    /// Whether `key` may have been superseded in this file. False
    /// positives are possible, false negatives are not.
    pub fn contains_invalid_key(&self, key: &[u8]) -> bool {
        self.invalid_keys.lock().may_contain(key)
    }

    pub fn can_be_deleted(&self) -> bool {
        self.can_be_deleted.load(Ordering::Acquire)
    }

    pub fn set_can_be_deleted(&self, value: bool) {
        self.can_be_deleted.store(value, Ordering::Release);
    }

    /// The persisted form of this descriptor.
    pub fn record(&self) -> FileRecord {
        FileRecord {
            file_id: self.file_id,
            file_name: self.file_name.clone(),
            total_entries: self.total_entries,
            deleted_entries: self.deleted_entries,
            timestamp: self.timestamp,
            oldest_deleted_timestamp: self.oldest_deleted_timestamp,
            latest_deleted_timestamp: self.latest_deleted_timestamp,
        }
    }
}

impl std::fmt::Debug for FileMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMetadata")
            .field("file_id", &self.file_id)
            .field("file_name", &self.file_name)
            .field("total", &self.total_entries)
            .field("invalid", &self.invalid_entries())
            .field("deleted", &self.deleted_entries)
            .field("timestamp", &self.timestamp)
            .field("can_be_deleted", &self.can_be_deleted())
            .finish()
    }
}

/// Something keeping a file alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileHolder {
    /// A metadata table generation that lists the file.
    Table(u64),
    /// A snapshot container entry holding a retired version from the file.
    Snapshot(u64),
    /// Merged away; released at the next complete checkpoint.
    PendingDelete,
}

struct ArenaEntry {
    metadata: Arc<FileMetadata>,
    holders: HashSet<FileHolder>,
}

/// Every open checkpoint file, indexed by id, with its holders.
pub struct FileArena {
    trace_type: String,
    files: Mutex<HashMap<u32, ArenaEntry>>,
    next_generation: AtomicU64,
}

impl FileArena {
    pub fn new(trace_type: impl Into<String>) -> Self {
        Self {
            trace_type: trace_type.into(),
            files: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::AcqRel)
    }

    /// Adds `holder` to `metadata`'s file, registering the file first if
    /// the arena has not seen it.
    pub fn hold(&self, metadata: &Arc<FileMetadata>, holder: FileHolder) {
        let mut files = self.files.lock();
        let entry = files
            .entry(metadata.file_id())
            .or_insert_with(|| ArenaEntry {
                metadata: Arc::clone(metadata),
                holders: HashSet::new(),
            });
        store_assert!(
            Arc::ptr_eq(&entry.metadata, metadata),
            "two descriptors registered for file {}",
            metadata.file_id()
        );
        entry.holders.insert(holder);
    }

    /// Adds `holder` to a file the arena already tracks. Returns `false`
    /// when the file is unknown.
    pub fn hold_id(&self, file_id: u32, holder: FileHolder) -> bool {
        match self.files.lock().get_mut(&file_id) {
            Some(entry) => {
                entry.holders.insert(holder);
                true
            }
            None => false,
        }
    }

    /// Drops `holder` from the file. The last holder of a deletable file
    /// deletes it from disk.
    pub fn release(&self, file_id: u32, holder: FileHolder) {
        let evicted = {
            let mut files = self.files.lock();
            let Some(entry) = files.get_mut(&file_id) else {
                return;
            };
            entry.holders.remove(&holder);
            if entry.holders.is_empty() {
                files.remove(&file_id).map(|e| e.metadata)
            } else {
                None
            }
        };

        let Some(metadata) = evicted else {
            return;
        };
        if metadata.can_be_deleted() {
            let file = metadata.file();
            match CheckpointFile::delete(file.dir(), file.name()) {
                Ok(()) => tracing::info!(
                    trace_type = %self.trace_type,
                    file_id,
                    name = file.name(),
                    "deleted checkpoint file"
                ),
                Err(e) => tracing::warn!(
                    trace_type = %self.trace_type,
                    file_id,
                    error = %e,
                    "failed to delete checkpoint file"
                ),
            }
        } else {
            tracing::debug!(trace_type = %self.trace_type, file_id, "closed checkpoint file");
        }
    }

    /// Flags a file for deletion once its last holder lets go.
    pub fn mark_can_be_deleted(&self, file_id: u32) {
        let metadata = self.get(file_id);
        store_assert!(metadata.is_some(), "file {} is not in the arena", file_id);
        if let Some(metadata) = metadata {
            metadata.set_can_be_deleted(true);
        }
    }

    pub fn get(&self, file_id: u32) -> Option<Arc<FileMetadata>> {
        self.files
            .lock()
            .get(&file_id)
            .map(|e| Arc::clone(&e.metadata))
    }

    pub fn contains(&self, file_id: u32) -> bool {
        self.files.lock().contains_key(&file_id)
    }

    /// Number of holders keeping `file_id` alive.
    pub fn reference_count(&self, file_id: u32) -> usize {
        self.files
            .lock()
            .get(&file_id)
            .map_or(0, |e| e.holders.len())
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl std::fmt::Debug for FileArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileArena")
            .field("files", &self.len())
            .finish()
    }
}

/// Map of file id to descriptor for one checkpoint generation.
///
/// Tables are built privately (`add_file`/`remove_file` take `&mut self`)
/// and published behind an `Arc`. Readers pin a published table with
/// [`pin`](Self::pin); the owner drops its reference with
/// [`release_ref`](Self::release_ref). When the count reaches zero the
/// table's generation lets go of its files.
pub struct MetadataTable {
    generation: u64,
    checkpoint_lsn: u64,
    files: BTreeMap<u32, Arc<FileMetadata>>,
    arena: Arc<FileArena>,
    refs: AtomicU64,
    released: AtomicBool,
}

impl MetadataTable {
    pub fn new(arena: Arc<FileArena>, checkpoint_lsn: u64) -> Self {
        Self {
            generation: arena.next_generation(),
            checkpoint_lsn,
            files: BTreeMap::new(),
            arena,
            refs: AtomicU64::new(1),
            released: AtomicBool::new(false),
        }
    }

    /// New generation listing the same files.
    pub fn copy(&self, checkpoint_lsn: u64) -> Self {
        let mut table = Self::new(Arc::clone(&self.arena), checkpoint_lsn);
        for metadata in self.files.values() {
            table.add_file(Arc::clone(metadata));
        }
        table
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn checkpoint_lsn(&self) -> u64 {
        self.checkpoint_lsn
    }

    pub fn add_file(&mut self, metadata: Arc<FileMetadata>) {
        let file_id = metadata.file_id();
        store_assert!(
            !self.files.contains_key(&file_id),
            "file {} is already in table generation {}",
            file_id,
            self.generation
        );
        self.arena.hold(&metadata, FileHolder::Table(self.generation));
        self.files.insert(file_id, metadata);
    }

    pub fn remove_file(&mut self, file_id: u32) -> Option<Arc<FileMetadata>> {
        let removed = self.files.remove(&file_id);
        if removed.is_some() {
            self.arena
                .release(file_id, FileHolder::Table(self.generation));
        }
        removed
    }

    pub fn get(&self, file_id: u32) -> Option<&Arc<FileMetadata>> {
        self.files.get(&file_id)
    }

    /// Descriptor of a file the caller knows to be listed.
    ///
    /// # Panics
    ///
    /// If the table does not list `file_id`.
    pub fn require(&self, file_id: u32) -> &Arc<FileMetadata> {
        match self.files.get(&file_id) {
            Some(metadata) => metadata,
            None => {
                tracing::error!(file_id, generation = self.generation, "file missing from metadata table");
                panic!(
                    "store invariant violated: file {} missing from table generation {}",
                    file_id, self.generation
                );
            }
        }
    }

    pub fn contains(&self, file_id: u32) -> bool {
        self.files.contains_key(&file_id)
    }

    /// Descriptors in ascending file id order.
    pub fn files(&self) -> impl Iterator<Item = &Arc<FileMetadata>> {
        self.files.values()
    }

    pub fn file_ids(&self) -> Vec<u32> {
        self.files.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn reference_count(&self) -> u64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Takes a reference unless the table has already been released.
    pub fn try_add_ref(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release_ref(&self) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        store_assert!(
            previous > 0,
            "table generation {} released more often than referenced",
            self.generation
        );
        if previous == 1 {
            self.release_files();
        }
    }

    /// Pins the table for the lifetime of the returned guard.
    pub fn pin(self: &Arc<Self>) -> Option<TablePin> {
        if self.try_add_ref() {
            Some(TablePin {
                table: Arc::clone(self),
            })
        } else {
            None
        }
    }

    fn release_files(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for file_id in self.files.keys() {
            self.arena
                .release(*file_id, FileHolder::Table(self.generation));
        }
    }
}

impl Drop for MetadataTable {
    fn drop(&mut self) {
        self.release_files();
    }
}

impl std::fmt::Debug for MetadataTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataTable")
            .field("generation", &self.generation)
            .field("checkpoint_lsn", &self.checkpoint_lsn)
            .field("files", &self.file_ids())
            .field("refs", &self.reference_count())
            .finish()
    }
}

/// A reader's reference on a published table.
pub struct TablePin {
    table: Arc<MetadataTable>,
}

impl TablePin {
    pub fn table(&self) -> &MetadataTable {
        &self.table
    }
}

impl std::ops::Deref for TablePin {
    type Target = MetadataTable;

    fn deref(&self) -> &MetadataTable {
        &self.table
    }
}

impl Drop for TablePin {
    fn drop(&mut self) {
        self.table.release_ref();
    }
}

/// File id and logical timestamp allocation for one store.
#[derive(Debug, Default)]
pub struct FileIds {
    file_id: AtomicU32,
    timestamp: AtomicU64,
}

impl FileIds {
    pub fn increment_file_id(&self) -> u32 {
        self.file_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn next_checkpoint_file_timestamp(&self) -> u64 {
        self.timestamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Makes sure later allocations are above everything recovered.
    pub fn restore(&self, max_file_id: u32, max_timestamp: u64) {
        self.file_id.fetch_max(max_file_id, Ordering::AcqRel);
        self.timestamp.fetch_max(max_timestamp, Ordering::AcqRel);
    }

    pub fn current_file_id(&self) -> u32 {
        self.file_id.load(Ordering::Acquire)
    }
}
