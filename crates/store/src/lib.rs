//! # Store - differential key-value store
//!
//! Ties the [`differential`] and [`checkpoint`] crates into a multi-version
//! store driven by a replicated state machine's checkpoint protocol.
//!
//! ## Architecture
//!
//! ```text
//! writes ─► differential (current, previous per key)
//!              │
//!              │ prepare_checkpoint: freeze, append as delta N
//!              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ aggregated state                                         │
//! │   delta N ─► ... ─► delta 1 ─► consolidated              │
//! └──────────────────────────────────────────────────────────┘
//!              │ perform_checkpoint: delta N ─► ckpt-<id> file
//!              │ consolidation (background or inline):
//!              │   deltas + consolidated ─► consolidated'
//!              │   optional file merge ─► merge-<id> file
//!              ▼
//!        complete_checkpoint: next metadata table becomes current,
//!        merged-away files are released
//! ```
//!
//! Superseded versions that snapshot readers may still need are handed to
//! the [`VersionManager`] and, if it says so, kept in the
//! [`SnapshotContainer`] until those readers finish.
//!
//! ## Module Responsibilities
//!
//! | Module              | Purpose                                              |
//! |---------------------|------------------------------------------------------|
//! | `lib.rs`            | `Store` struct, constructor, accessors, `Debug`, `Drop` |
//! | [`write`]           | `add()`, `update()`, `remove()`, `apply()`           |
//! | [`read`]            | `get()`, `get_at()`, `read_next()`, `keys()`, swept value reload |
//! | [`checkpointing`]   | prepare / perform / complete, background glue        |
//! | [`recovery`]        | `recover_checkpoint()`, stray file trimming          |
//! | [`lifecycle`]       | `clear()`, `close()`                                 |
//! | [`consolidation`]   | delta chain consolidation and sweep                  |
//! | [`merge`]           | checkpoint file merge                                |
//! | [`metadata`]        | file descriptors, metadata tables, file arena        |
//! | [`metadata_manager`]| metadata table persistence                           |
//!
//! ## Metadata tables
//!
//! ```text
//!   current ── what the last completed checkpoint persisted
//!   next    ── built by perform_checkpoint, installed by complete_checkpoint
//!   merge   ── output of a file merge not yet folded into next
//! ```
//!
//! Readers that need a swept value pin whichever table lists its file.

mod aggregated;
mod background;
mod checkpointing;
mod consolidated;
mod consolidation;
mod context;
mod error;
mod lifecycle;
mod merge;
mod merge_helper;
mod metadata;
mod metadata_manager;
mod read;
mod recovery;
mod retire;
mod snapshot;
mod write;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use config::StoreConfig;
use differential::{bytewise, DifferentialComponent, SharedComparer};
use parking_lot::Mutex;

pub use aggregated::AggregatedState;
pub use background::{BackgroundTask, SweepTask};
pub use consolidated::ConsolidatedComponent;
pub use consolidation::ConsolidationManager;
pub use error::{CancellationToken, Result, StoreError};
pub use merge::PostMergeMetadataInfo;
pub use merge_helper::{ConsolidationMode, MergeHelper};
pub use metadata::{FileArena, FileHolder, FileIds, FileMetadata, MetadataTable, TablePin};
pub use metadata_manager::{FileRecord, MetadataManager, MetadataPaths, PersistedTable};
pub use retire::{AlwaysRemovable, TryRemoveVersionResult, VersionManager, VersionRetirer};
pub use snapshot::{SnapshotComponent, SnapshotContainer, SnapshotReaper};
pub use write::WriteOp;

use checkpointing::PreparedCheckpoint;
use context::StoreContext;

type ConsolidationResult = Result<Option<PostMergeMetadataInfo>>;

/// A differential store instance.
///
/// # Checkpoint protocol
///
/// 1. [`prepare_checkpoint`](Store::prepare_checkpoint) freezes the
///    differential component and chains it onto the aggregated state.
/// 2. [`perform_checkpoint`](Store::perform_checkpoint) writes it to a new
///    checkpoint file, builds the next metadata table and runs (or starts)
///    consolidation.
/// 3. [`complete_checkpoint`](Store::complete_checkpoint) makes the next
///    table current and releases files merged away.
///
/// # Read Path
///
/// Differential first, then (for snapshot reads) the snapshot container,
/// then the delta chain newest first, then the consolidated base.
pub struct Store {
    pub(crate) ctx: Arc<StoreContext>,
    pub(crate) manager: Arc<ConsolidationManager>,
    pub(crate) snapshots: Arc<SnapshotContainer>,
    pub(crate) reaper: SnapshotReaper,
    pub(crate) differential: ArcSwap<DifferentialComponent>,
    /// Serializes writers with the differential rotation.
    pub(crate) write_lock: Mutex<()>,
    pub(crate) current_table: ArcSwap<MetadataTable>,
    pub(crate) next_table: ArcSwapOption<MetadataTable>,
    pub(crate) prepared: Mutex<Option<PreparedCheckpoint>>,
    /// Files merged away, deleted once the table listing them is replaced.
    pub(crate) files_to_be_deleted: Mutex<BTreeSet<u32>>,
    pub(crate) consolidation: BackgroundTask<ConsolidationResult>,
    pub(crate) sweep: Arc<SweepTask>,
    pub(crate) count: AtomicI64,
    pub(crate) closed: AtomicBool,
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub count: i64,
    pub differential_keys: usize,
    pub deltas: u32,
    pub consolidated_keys: usize,
    pub files: usize,
    pub open_files: usize,
    pub snapshot_entries: usize,
    pub pending_deletes: usize,
}

impl Store {
    /// Opens an empty store with byte-wise key ordering.
    ///
    /// Nothing is read from disk; call
    /// [`recover_checkpoint`](Store::recover_checkpoint) to load the last
    /// completed checkpoint.
    pub fn open(config: StoreConfig, versions: Arc<dyn VersionManager>) -> Result<Self> {
        Self::open_with_comparer(config, versions, bytewise())
    }

    pub fn open_with_comparer(
        config: StoreConfig,
        versions: Arc<dyn VersionManager>,
        comparer: SharedComparer,
    ) -> Result<Self> {
        if config.has_persisted_state {
            std::fs::create_dir_all(&config.working_dir)?;
        }
        let state_provider_id = config.state_provider_id;
        let ctx = Arc::new(StoreContext::new(config, comparer.clone()));

        let snapshots = Arc::new(SnapshotContainer::new(Arc::clone(&ctx.arena)));
        let reaper = SnapshotReaper::spawn(Arc::clone(&snapshots), ctx.trace_type().to_string())?;
        let retirer = VersionRetirer::new(
            state_provider_id,
            ctx.trace_type().to_string(),
            versions,
            Arc::clone(&snapshots),
            reaper.sender(),
        );
        let manager = Arc::new(ConsolidationManager::new(Arc::clone(&ctx), retirer));
        let empty_table = MetadataTable::new(Arc::clone(&ctx.arena), 0);

        tracing::info!(
            trace_type = ctx.trace_type(),
            dir = %ctx.config.working_dir.display(),
            persisted = ctx.config.has_persisted_state,
            background = ctx.config.enable_background_consolidation,
            "opened store"
        );

        Ok(Self {
            ctx,
            manager,
            snapshots,
            reaper,
            differential: ArcSwap::from_pointee(DifferentialComponent::new(comparer)),
            write_lock: Mutex::new(()),
            current_table: ArcSwap::from_pointee(empty_table),
            next_table: ArcSwapOption::const_empty(),
            prepared: Mutex::new(None),
            files_to_be_deleted: Mutex::new(BTreeSet::new()),
            consolidation: BackgroundTask::new("consolidation"),
            sweep: Arc::new(SweepTask::new()),
            count: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.ctx.config
    }

    pub fn trace_type(&self) -> &str {
        self.ctx.trace_type()
    }

    pub fn consolidation_manager(&self) -> &Arc<ConsolidationManager> {
        &self.manager
    }

    pub fn snapshot_container(&self) -> &Arc<SnapshotContainer> {
        &self.snapshots
    }

    pub fn file_arena(&self) -> &Arc<FileArena> {
        &self.ctx.arena
    }

    /// The metadata table of the last completed checkpoint.
    pub fn current_metadata_table(&self) -> Arc<MetadataTable> {
        self.current_table.load_full()
    }

    pub fn next_metadata_table(&self) -> Option<Arc<MetadataTable>> {
        self.next_table.load_full()
    }

    pub fn merge_metadata_table(&self) -> Option<Arc<MetadataTable>> {
        self.ctx.merge_table.load_full()
    }

    /// Ids of files waiting for the next complete checkpoint to go away.
    pub fn files_to_be_deleted(&self) -> Vec<u32> {
        self.files_to_be_deleted.lock().iter().copied().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn stats(&self) -> StoreStats {
        let aggregated = self.manager.aggregated();
        StoreStats {
            count: self.count.load(Ordering::Acquire),
            differential_keys: self.differential.load().len(),
            deltas: aggregated.index(),
            consolidated_keys: aggregated.consolidated().len(),
            files: self.current_table.load().len(),
            open_files: self.ctx.arena.len(),
            snapshot_entries: self.snapshots.len(),
            pending_deletes: self.files_to_be_deleted.lock().len(),
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("trace_type", &self.trace_type())
            .field("stats", &self.stats())
            .field("consolidation", &self.consolidation)
            .field("sweep", &self.sweep)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Stops background work on drop. Nothing is flushed: unprepared writes
/// are recovered by the replication layer, not by the store.
impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(trace_type = self.trace_type(), error = %e, "close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests;
