//! Version retirement.
//!
//! Whenever a version of a key is superseded and about to disappear from
//! the live components, the store asks the [`VersionManager`] whether some
//! snapshot reader can still see it. If so, the version is copied into the
//! snapshot container for each visibility sequence number that needs it.

use std::collections::BTreeSet;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use differential::VersionedRecord;

use crate::snapshot::{send_watch, ReaperMessage, SnapshotContainer};
use crate::store_assert;

/// Answer to a [`VersionManager::try_remove_version`] call.
#[derive(Debug, Default)]
pub struct TryRemoveVersionResult {
    pub can_be_removed: bool,
    /// Visibility sequence numbers whose readers still need the version.
    pub enumeration_set: BTreeSet<u64>,
    /// Fires (or disconnects) when the readers at that sequence number
    /// have all finished. Every sequence number in `enumeration_set` needs
    /// one here unless an earlier notification for it is still pending.
    pub completion_notifications: Vec<(u64, Receiver<()>)>,
}

impl TryRemoveVersionResult {
    pub fn removable() -> Self {
        Self {
            can_be_removed: true,
            ..Self::default()
        }
    }
}

/// The replication layer's view of outstanding snapshot readers.
pub trait VersionManager: Send + Sync {
    fn try_remove_version(
        &self,
        state_provider_id: u64,
        deleted_seq: u64,
        next_seq: u64,
    ) -> TryRemoveVersionResult;
}

/// A version manager without snapshot readers.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRemovable;

impl VersionManager for AlwaysRemovable {
    fn try_remove_version(&self, _: u64, _: u64, _: u64) -> TryRemoveVersionResult {
        TryRemoveVersionResult::removable()
    }
}

pub struct VersionRetirer {
    state_provider_id: u64,
    trace_type: String,
    versions: Arc<dyn VersionManager>,
    snapshots: Arc<SnapshotContainer>,
    reaper: Sender<ReaperMessage>,
}

impl VersionRetirer {
    pub(crate) fn new(
        state_provider_id: u64,
        trace_type: String,
        versions: Arc<dyn VersionManager>,
        snapshots: Arc<SnapshotContainer>,
        reaper: Sender<ReaperMessage>,
    ) -> Self {
        Self {
            state_provider_id,
            trace_type,
            versions,
            snapshots,
            reaper,
        }
    }

    pub fn snapshots(&self) -> &Arc<SnapshotContainer> {
        &self.snapshots
    }

    /// Retires every version of `versions` except the last, each against
    /// its successor. `versions` is ordered oldest first.
    ///
    /// # Panics
    ///
    /// If two consecutive versions are not in strictly increasing sequence
    /// number order.
    pub fn retire(&self, key: &[u8], versions: &[Arc<VersionedRecord>]) {
        for pair in versions.windows(2) {
            let (deleted, next) = (&pair[0], &pair[1]);
            store_assert!(
                deleted.seq() < next.seq(),
                "retiring version {} against non-newer version {}",
                deleted.seq(),
                next.seq()
            );

            let result =
                self.versions
                    .try_remove_version(self.state_provider_id, deleted.seq(), next.seq());
            for (lsn, _) in &result.completion_notifications {
                self.snapshots.register_watch(*lsn);
            }
            if !result.can_be_removed {
                self.preserve(key, deleted, &result.enumeration_set);
            }
            for (lsn, done) in result.completion_notifications {
                send_watch(&self.reaper, lsn, done);
            }
        }
    }

    fn preserve(&self, key: &[u8], version: &Arc<VersionedRecord>, lsns: &BTreeSet<u64>) {
        for &lsn in lsns {
            if !self.snapshots.preserve(lsn, key, version) {
                tracing::warn!(
                    trace_type = %self.trace_type,
                    lsn,
                    seq = version.seq(),
                    "no completion pending for snapshot readers; version not kept"
                );
                continue;
            }
            tracing::trace!(
                trace_type = %self.trace_type,
                lsn,
                seq = version.seq(),
                file_id = version.file_id(),
                "moved version into snapshot container"
            );
        }
    }
}

impl std::fmt::Debug for VersionRetirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionRetirer")
            .field("state_provider_id", &self.state_provider_id)
            .field("snapshots", &self.snapshots)
            .finish()
    }
}
