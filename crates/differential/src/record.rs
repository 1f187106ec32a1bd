use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Inserted = 1,
    Updated = 2,
    Deleted = 3,
}

impl RecordKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<RecordKind> {
        match raw {
            1 => Some(RecordKind::Inserted),
            2 => Some(RecordKind::Updated),
            3 => Some(RecordKind::Deleted),
            _ => None,
        }
    }
}

/// Where a record's value lives on disk. `file_id == 0` means memory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueLocation {
    pub file_id: u32,
    pub offset: u64,
    pub size: u32,
}

impl ValueLocation {
    pub fn new(file_id: u32, offset: u64, size: u32) -> Self {
        Self {
            file_id,
            offset,
            size,
        }
    }
}

/// One version of one key.
///
/// The value slot may be evicted ("swept") once the record is backed by a
/// checkpoint file; readers reload it from `location()` on demand. Readers
/// set `in_use` before reading the slot so a concurrent sweep skips the
/// record for one cycle.
pub struct VersionedRecord {
    kind: RecordKind,
    seq: u64,
    location: Mutex<ValueLocation>,
    // Logical stamp of the checkpoint that first wrote a tombstone.
    timestamp: AtomicU64,
    value: RwLock<Option<Arc<[u8]>>>,
    in_use: AtomicBool,
}

impl VersionedRecord {
    fn build(kind: RecordKind, seq: u64, value: Option<Arc<[u8]>>) -> Self {
        Self {
            kind,
            seq,
            location: Mutex::new(ValueLocation::default()),
            timestamp: AtomicU64::new(0),
            value: RwLock::new(value),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn inserted(seq: u64, value: impl Into<Arc<[u8]>>) -> Self {
        Self::build(RecordKind::Inserted, seq, Some(value.into()))
    }

    pub fn updated(seq: u64, value: impl Into<Arc<[u8]>>) -> Self {
        Self::build(RecordKind::Updated, seq, Some(value.into()))
    }

    pub fn deleted(seq: u64) -> Self {
        Self::build(RecordKind::Deleted, seq, None)
    }

    /// Record loaded from a checkpoint key file; the value stays on disk.
    pub fn from_checkpoint(
        kind: RecordKind,
        seq: u64,
        location: ValueLocation,
        timestamp: u64,
    ) -> Self {
        let record = Self::build(kind, seq, None);
        *record.location.lock() = location;
        record.timestamp.store(timestamp, Ordering::Release);
        record
    }

    /// Copy of this record pointing at a new on-disk location.
    ///
    /// Used after a file merge: published records are never relocated in
    /// place, the consolidated component swaps in the copy instead.
    pub fn with_location(&self, location: ValueLocation) -> Self {
        let copy = Self::build(self.kind, self.seq, self.value());
        *copy.location.lock() = location;
        copy.timestamp.store(self.timestamp(), Ordering::Release);
        copy
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == RecordKind::Deleted
    }

    pub fn location(&self) -> ValueLocation {
        *self.location.lock()
    }

    pub fn file_id(&self) -> u32 {
        self.location.lock().file_id
    }

    /// Records the checkpoint file that now holds this version.
    pub fn set_location(&self, location: ValueLocation) {
        *self.location.lock() = location;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Stamps a tombstone the first time it is checkpointed. Later stamps
    /// are ignored.
    pub fn set_timestamp_if_unset(&self, timestamp: u64) {
        let _ = self
            .timestamp
            .compare_exchange(0, timestamp, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn value(&self) -> Option<Arc<[u8]>> {
        self.value.read().clone()
    }

    pub fn is_in_memory(&self) -> bool {
        self.value.read().is_some()
    }

    /// Size of the cached value, 0 when swept.
    pub fn value_size(&self) -> usize {
        self.value.read().as_ref().map_or(0, |v| v.len())
    }

    /// Caches a value reloaded from disk.
    pub fn set_value(&self, value: Arc<[u8]>) {
        if self.kind != RecordKind::Deleted {
            *self.value.write() = Some(value);
        }
    }

    /// Drops the cached value. Returns `true` if something was evicted.
    pub fn sweep(&self) -> bool {
        self.value.write().take().is_some()
    }

    pub fn mark_in_use(&self) {
        self.in_use.store(true, Ordering::Release);
    }

    /// Clears the reader mark, returning whether it was set.
    pub fn clear_in_use(&self) -> bool {
        self.in_use.swap(false, Ordering::AcqRel)
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn can_be_swept_to_disk(&self) -> bool {
        self.file_id() > 0
    }
}

impl fmt::Debug for VersionedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedRecord")
            .field("kind", &self.kind)
            .field("seq", &self.seq)
            .field("location", &self.location())
            .field("timestamp", &self.timestamp())
            .field("in_memory", &self.is_in_memory())
            .field("in_use", &self.is_in_use())
            .finish()
    }
}
