//! Write path: every change lands in the differential component.
//!
//! A write that pushes a key's third version out of the differential hands
//! the evicted version to version retirement, the same way consolidation
//! does for versions it drops.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use differential::VersionedRecord;

use crate::error::Result;
use crate::Store;

/// One change applied by the replication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Add { key: Vec<u8>, value: Vec<u8>, seq: u64 },
    Update { key: Vec<u8>, value: Vec<u8>, seq: u64 },
    Remove { key: Vec<u8>, seq: u64 },
}

impl WriteOp {
    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Add { key, .. } | WriteOp::Update { key, .. } | WriteOp::Remove { key, .. } => key,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            WriteOp::Add { seq, .. } | WriteOp::Update { seq, .. } | WriteOp::Remove { seq, .. } => *seq,
        }
    }
}

impl Store {
    /// Inserts `key` at commit sequence number `seq`.
    pub fn add(&self, key: &[u8], value: &[u8], seq: u64) -> Result<()> {
        self.write(key, Arc::new(VersionedRecord::inserted(seq, value)))
    }

    /// Replaces the value of `key` at commit sequence number `seq`.
    pub fn update(&self, key: &[u8], value: &[u8], seq: u64) -> Result<()> {
        self.write(key, Arc::new(VersionedRecord::updated(seq, value)))
    }

    /// Deletes `key` at commit sequence number `seq`.
    pub fn remove(&self, key: &[u8], seq: u64) -> Result<()> {
        self.write(key, Arc::new(VersionedRecord::deleted(seq)))
    }

    pub fn apply(&self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::Add { key, value, seq } => self.add(&key, &value, seq),
            WriteOp::Update { key, value, seq } => self.update(&key, &value, seq),
            WriteOp::Remove { key, seq } => self.remove(&key, seq),
        }
    }

    fn write(&self, key: &[u8], record: Arc<VersionedRecord>) -> Result<()> {
        self.ensure_open()?;
        let deleting = record.is_deleted();

        let _guard = self.write_lock.lock();
        let was_live = self.read_record(key).map_or(false, |r| !r.is_deleted());
        let differential = self.differential.load();
        if let Some(pair) = differential.add(key, record) {
            self.manager
                .retirer()
                .retire(key, &[pair.retired, pair.next]);
        }

        match (was_live, deleting) {
            (false, false) => {
                self.count.fetch_add(1, Ordering::AcqRel);
            }
            (true, true) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
        Ok(())
    }
}
