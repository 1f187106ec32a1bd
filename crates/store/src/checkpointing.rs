//! Checkpoint protocol: prepare, perform, complete.
//!
//! ```text
//!   prepare(lsn)   differential ──freeze──► delta N (aggregated state)
//!   perform        delta N ──► ckpt-<id>; next = current + ckpt-<id>
//!                  fold a finished merge into next; persist next as temp
//!                  consolidate (inline) or start it (background)
//!   complete       temp ──► metadata.tbl; current = next;
//!                  release merged-away files
//! ```
//!
//! A failed perform leaves the prepared delta in place so the orchestrator
//! can simply call it again.

use std::sync::Arc;

use checkpoint::{CheckpointFile, IoPriority};
use differential::DifferentialComponent;

use crate::context::checkpoint_file_name;
use crate::error::{CancellationToken, Result};
use crate::merge::PostMergeMetadataInfo;
use crate::merge_helper::ConsolidationMode;
use crate::metadata::{FileHolder, FileMetadata, MetadataTable};
use crate::metadata_manager::{MetadataManager, MetadataPaths};
use crate::store_assert;
use crate::Store;

/// A delta frozen by `prepare_checkpoint`, waiting to be written.
#[derive(Debug, Clone)]
pub(crate) struct PreparedCheckpoint {
    pub lsn: u64,
    pub delta: Arc<DifferentialComponent>,
}

impl Store {
    /// Freezes the differential component as delta N and starts a fresh
    /// one for writes after `lsn`.
    pub fn prepare_checkpoint(&self, lsn: u64) -> Result<()> {
        self.ensure_open()?;
        let mut prepared = self.prepared.lock();
        store_assert!(
            prepared.is_none(),
            "prepare_checkpoint({}) while a prepared checkpoint is pending",
            lsn
        );

        let fresh = Arc::new(DifferentialComponent::new(self.ctx.comparer.clone()));
        let delta = {
            let _guard = self.write_lock.lock();
            self.differential.swap(fresh)
        };
        delta.sort();
        self.manager.append_delta(Arc::clone(&delta));

        tracing::info!(
            trace_type = self.trace_type(),
            lsn,
            keys = delta.len(),
            "prepared checkpoint"
        );
        *prepared = Some(PreparedCheckpoint { lsn, delta });
        Ok(())
    }

    /// Writes the prepared delta, builds the next metadata table and drives
    /// consolidation. A no-op when nothing was prepared.
    pub fn perform_checkpoint(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        let _prime = self
            .ctx
            .acquire_prime_shared("checkpoint", self.ctx.config.checkpoint_lock_timeout)?;
        let Some(prepared) = self.prepared.lock().clone() else {
            tracing::debug!(trace_type = self.trace_type(), "nothing prepared to checkpoint");
            return Ok(());
        };
        store_assert!(
            self.next_table.load().is_none(),
            "perform_checkpoint({}) before the previous checkpoint completed",
            prepared.lsn
        );

        let current = self.current_table.load_full();
        let mut next = current.copy(prepared.lsn);
        if self.ctx.config.has_persisted_state {
            if let Some(file) = self.write_checkpoint_file(&prepared.delta)? {
                next.add_file(file);
            }
        }

        let background = self.ctx.config.enable_background_consolidation;
        if background {
            if let Some(result) = self.consolidation.take_result() {
                match result {
                    Ok(Some(info)) => self.process_merged_files(&mut next, info),
                    Ok(None) => {}
                    Err(e) if e.is_retriable() => {
                        tracing::debug!(trace_type = self.trace_type(), error = %e, "background consolidation stopped");
                    }
                    Err(e) => return Err(e),
                }
            }
        } else {
            let merged = self
                .manager
                .consolidate_locked(&next, ConsolidationMode::Default, cancel)?;
            if let Some(info) = merged {
                self.process_merged_files(&mut next, info);
            }
        }

        if self.ctx.config.has_persisted_state {
            let paths = MetadataPaths::in_dir(&self.ctx.config.working_dir);
            MetadataManager::write(&next, &paths.temp)?;
        }

        let next = Arc::new(next);
        if background {
            self.start_consolidation(&next)?;
        } else if self.manager.reset_to_new_aggregated_state() && self.ctx.config.enable_sweep {
            self.start_sweep();
        }

        tracing::info!(
            trace_type = self.trace_type(),
            lsn = prepared.lsn,
            files = next.len(),
            generation = next.generation(),
            "performed checkpoint"
        );
        self.next_table.store(Some(next));
        self.prepared.lock().take();
        Ok(())
    }

    /// Installs the next metadata table as current. A no-op when no
    /// checkpoint was performed.
    pub fn complete_checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        let _prime = self
            .ctx
            .acquire_prime_shared("checkpoint", self.ctx.config.checkpoint_lock_timeout)?;
        let Some(next) = self.next_table.swap(None) else {
            tracing::debug!(trace_type = self.trace_type(), "nothing to complete");
            return Ok(());
        };

        if self.ctx.config.has_persisted_state {
            let paths = MetadataPaths::in_dir(&self.ctx.config.working_dir);
            if let Err(e) =
                MetadataManager::safe_file_replace(&paths.current, &paths.temp, &paths.backup)
            {
                self.next_table.store(Some(next));
                return Err(e.into());
            }
        }

        let lsn = next.checkpoint_lsn();
        let old = self.current_table.swap(next);
        old.release_ref();

        let pending = std::mem::take(&mut *self.files_to_be_deleted.lock());
        for file_id in &pending {
            self.ctx.arena.release(*file_id, FileHolder::PendingDelete);
        }

        tracing::info!(
            trace_type = self.trace_type(),
            lsn,
            released = pending.len(),
            "completed checkpoint"
        );

        if self.ctx.config.enable_sweep {
            self.start_sweep();
        }
        Ok(())
    }

    /// Writes `delta`'s current versions as a new checkpoint file. `None`
    /// for an empty delta.
    fn write_checkpoint_file(&self, delta: &DifferentialComponent) -> Result<Option<Arc<FileMetadata>>> {
        if delta.is_empty() {
            return Ok(None);
        }
        let file_id = self.ctx.ids.increment_file_id();
        let timestamp = self.ctx.ids.next_checkpoint_file_timestamp();
        let name = checkpoint_file_name(file_id);
        let items = delta.iter().map(|(key, versions)| (key, versions.current));
        let file = CheckpointFile::create(
            &self.ctx.config.working_dir,
            &name,
            file_id,
            timestamp,
            delta.len(),
            self.ctx.comparer.clone(),
            IoPriority::Normal,
            items,
        )?;

        let (oldest, latest) = delta
            .iter()
            .filter(|(_, v)| v.current.is_deleted())
            .map(|(_, v)| v.current.timestamp())
            .fold((0, 0), |(lo, hi), ts| {
                (if lo == 0 { ts } else { lo.min(ts) }, hi.max(ts))
            });

        tracing::debug!(
            trace_type = self.trace_type(),
            file_id,
            keys = file.key_count(),
            deleted = file.deleted_key_count(),
            "wrote checkpoint file"
        );
        Ok(Some(Arc::new(FileMetadata::new(file, oldest, latest))))
    }

    /// Swaps the merge inputs in `next` for the merged file. The inputs stay
    /// on disk until the table still listing them is replaced.
    pub(crate) fn process_merged_files(&self, next: &mut MetadataTable, info: PostMergeMetadataInfo) {
        let mut pending = self.files_to_be_deleted.lock();
        for &file_id in &info.deleted_file_ids {
            store_assert!(
                next.contains(file_id),
                "merged file {} is not in the next metadata table",
                file_id
            );
            self.ctx.arena.mark_can_be_deleted(file_id);
            if self.ctx.arena.hold_id(file_id, FileHolder::PendingDelete) {
                pending.insert(file_id);
            }
            next.remove_file(file_id);
        }
        if let Some(merged) = &info.merged_file {
            next.add_file(Arc::clone(merged));
        }
        self.ctx.set_merge_table(None);

        tracing::info!(
            trace_type = self.trace_type(),
            deleted = ?info.deleted_file_ids,
            merged_file_id = info.merged_file.as_ref().map(|m| m.file_id()),
            "folded merge into next metadata table"
        );
    }

    /// Starts a background consolidation against `table` unless one is
    /// already running.
    fn start_consolidation(&self, table: &Arc<MetadataTable>) -> Result<()> {
        let Some(pin) = table.pin() else {
            return Ok(());
        };
        let manager = Arc::clone(&self.manager);
        let sweep = Arc::clone(&self.sweep);
        let sweep_enabled = self.ctx.config.enable_sweep;
        let started = self.consolidation.start(move |cancel| {
            let installed = manager.installed_states();
            let result = manager.consolidate(&pin, ConsolidationMode::Default, &cancel);
            drop(pin);
            if sweep_enabled && manager.installed_states() > installed {
                start_sweep(&sweep, &manager);
            }
            result
        })?;
        if started {
            tracing::debug!(trace_type = self.trace_type(), "started background consolidation");
        }
        Ok(())
    }

    pub(crate) fn start_sweep(&self) {
        start_sweep(&self.sweep, &self.manager);
    }

    /// Waits for a running background consolidation. Its merge result is
    /// folded in by the next `perform_checkpoint`.
    pub fn wait_for_consolidation(&self) {
        self.consolidation.wait();
    }

    /// Waits for a running sweep.
    pub fn wait_for_sweep(&self) {
        self.sweep.wait();
    }
}

fn start_sweep(sweep: &Arc<crate::background::SweepTask>, manager: &Arc<crate::ConsolidationManager>) {
    let manager = Arc::clone(manager);
    sweep.try_start_sweep(move |cancel| match manager.sweep(cancel) {
        Ok(_) => {}
        Err(e) if e.is_retriable() => {}
        Err(e) => tracing::warn!(error = %e, "sweep failed"),
    });
}
