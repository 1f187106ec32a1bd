use std::sync::atomic::Ordering;
use std::sync::Arc;

use differential::DifferentialComponent;

use crate::error::Result;
use crate::metadata::{FileHolder, MetadataTable};
use crate::metadata_manager::{MetadataManager, MetadataPaths};
use crate::Store;

impl Store {
    /// Drops all state. Every checkpoint file is deleted once nothing
    /// holds it any more, and an empty metadata table is persisted.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.stop_background_work();
        let _prime = self
            .ctx
            .acquire_prime_exclusive("clear", self.ctx.config.consolidation_lock_timeout)?;

        if self.ctx.config.has_persisted_state {
            let paths = MetadataPaths::in_dir(&self.ctx.config.working_dir);
            MetadataManager::write_records(0, &[], &paths.temp)?;
            MetadataManager::safe_file_replace(&paths.current, &paths.temp, &paths.backup)?;
        }

        self.prepared.lock().take();
        {
            let _guard = self.write_lock.lock();
            self.differential
                .store(Arc::new(DifferentialComponent::new(self.ctx.comparer.clone())));
            self.count.store(0, Ordering::Release);
        }
        self.manager.reset();

        if let Some(merge) = self.ctx.merge_table.load_full() {
            mark_deletable(&merge);
        }
        self.ctx.set_merge_table(None);
        if let Some(next) = self.next_table.swap(None) {
            mark_deletable(&next);
            next.release_ref();
        }
        let empty = Arc::new(MetadataTable::new(Arc::clone(&self.ctx.arena), 0));
        let old = self.current_table.swap(empty);
        mark_deletable(&old);
        old.release_ref();

        self.release_pending_deletes();
        self.snapshots.clear();

        tracing::info!(trace_type = self.trace_type(), "cleared store");
        Ok(())
    }

    /// Stops background work and releases every file. Files merged away
    /// but not yet released stay on disk; recovery trims them.
    ///
    /// Idempotent. Later operations fail with [`StoreError::Closed`](crate::StoreError::Closed).
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_background_work();
        let _prime = self
            .ctx
            .acquire_prime_exclusive("close", self.ctx.config.consolidation_lock_timeout)?;

        {
            let mut pending = self.files_to_be_deleted.lock();
            for &file_id in pending.iter() {
                if let Some(file) = self.ctx.arena.get(file_id) {
                    file.set_can_be_deleted(false);
                }
                self.ctx.arena.release(file_id, FileHolder::PendingDelete);
            }
            pending.clear();
        }
        self.prepared.lock().take();
        self.ctx.set_merge_table(None);
        if let Some(next) = self.next_table.swap(None) {
            next.release_ref();
        }
        self.reaper.shutdown();
        self.snapshots.clear();

        tracing::info!(trace_type = self.trace_type(), "closed store");
        Ok(())
    }

    fn stop_background_work(&self) {
        if let Some(Err(e)) = self.consolidation.cancel_and_wait() {
            if !e.is_retriable() {
                tracing::warn!(trace_type = self.trace_type(), error = %e, "discarding failed consolidation");
            }
        }
        self.sweep.cancel_sweep();
    }

    fn release_pending_deletes(&self) {
        let pending = std::mem::take(&mut *self.files_to_be_deleted.lock());
        for file_id in pending {
            self.ctx.arena.release(file_id, FileHolder::PendingDelete);
        }
    }
}

fn mark_deletable(table: &MetadataTable) {
    for file in table.files() {
        file.set_can_be_deleted(true);
    }
}
