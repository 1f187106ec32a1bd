//! Cold start from the last completed checkpoint.
//!
//! 1. Finish an interrupted metadata replace.
//! 2. Open every file the metadata table lists.
//! 3. Delete checkpoint files the table does not list (left behind by a
//!    crash between writing a file and completing its checkpoint).
//! 4. Merge all files into the consolidated component. The newest entry
//!    per key wins; the entries it shadows are counted invalid in their
//!    files, so merge policies see the same numbers they saw before the
//!    restart.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use checkpoint::{IoPriority, MergeIterator, MergedEntry, KEY_FILE_EXTENSION, VALUE_FILE_EXTENSION};

use crate::context::{CHECKPOINT_FILE_PREFIX, MERGED_FILE_PREFIX};
use crate::error::Result;
use crate::metadata::{FileMetadata, MetadataTable};
use crate::metadata_manager::{MetadataManager, MetadataPaths};
use crate::store_assert;
use crate::Store;

impl Store {
    /// Loads the last completed checkpoint into an empty store.
    ///
    /// Without persisted state, or when no checkpoint was ever completed,
    /// the store stays empty.
    pub fn recover_checkpoint(&self) -> Result<()> {
        self.ensure_open()?;
        store_assert!(
            self.differential.load().is_empty() && self.manager.aggregated().index() == 0,
            "recover_checkpoint on a store that already holds writes"
        );
        if !self.ctx.config.has_persisted_state {
            return Ok(());
        }

        let dir = self.ctx.config.working_dir.clone();
        let paths = MetadataPaths::in_dir(&dir);
        MetadataManager::recover_file_replace(&paths.current, &paths.temp, &paths.backup)?;
        if !paths.current.exists() {
            tracing::info!(trace_type = self.trace_type(), "no checkpoint to recover");
            self.trim_files(&dir, &HashSet::new())?;
            return Ok(());
        }

        let persisted = MetadataManager::open(&paths.current)?;
        let mut table = MetadataTable::new(Arc::clone(&self.ctx.arena), persisted.checkpoint_lsn);
        let mut max_file_id = 0;
        let mut max_timestamp = 0;
        for record in &persisted.files {
            let metadata = FileMetadata::open(&dir, record, self.ctx.comparer.clone())?;
            max_file_id = max_file_id.max(metadata.file_id());
            max_timestamp = max_timestamp.max(metadata.timestamp());
            table.add_file(Arc::new(metadata));
        }
        self.ctx.ids.restore(max_file_id, max_timestamp);

        let listed: HashSet<String> = table.files().map(|f| f.file_name().to_string()).collect();
        self.trim_files(&dir, &listed)?;

        self.manager.reset();
        let live = self.recover_consolidated_state(&table)?;
        self.count.store(live, Ordering::Release);

        tracing::info!(
            trace_type = self.trace_type(),
            lsn = table.checkpoint_lsn(),
            files = table.len(),
            keys = live,
            "recovered checkpoint"
        );
        let old = self.current_table.swap(Arc::new(table));
        old.release_ref();
        Ok(())
    }

    /// Rebuilds the consolidated component from every listed file and
    /// returns the number of live keys.
    fn recover_consolidated_state(&self, table: &MetadataTable) -> Result<i64> {
        let mut sources = Vec::with_capacity(table.len());
        for file in table.files() {
            sources.push(file.file().enumerate(IoPriority::Normal)?);
        }
        let mut merged = MergeIterator::new(sources, self.ctx.comparer.clone())?;

        let mut live = 0i64;
        while let Some(MergedEntry { entry, skipped }) = merged.next_entry()? {
            for shadowed in skipped.iter().filter(|e| !e.is_deleted()) {
                table
                    .require(shadowed.location.file_id)
                    .add_invalid_key(&shadowed.key);
            }
            if entry.is_deleted() {
                continue;
            }
            self.manager.add(&entry.key, Arc::new(entry.to_record()));
            live += 1;
        }
        Ok(live)
    }

    /// Deletes checkpoint files (and their temp files) whose base name is
    /// not in `listed`.
    fn trim_files(&self, dir: &Path, listed: &HashSet<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(base) = checkpoint_base_name(name) else {
                continue;
            };
            if listed.contains(base) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(
                    trace_type = self.trace_type(),
                    file = name,
                    "trimmed unreferenced checkpoint file"
                ),
                Err(e) => tracing::warn!(
                    trace_type = self.trace_type(),
                    file = name,
                    error = %e,
                    "failed to trim checkpoint file"
                ),
            }
        }
        Ok(())
    }
}

/// `ckpt-0000000003.sdk.tmp` → `ckpt-0000000003`. `None` for anything that
/// is not a checkpoint file.
fn checkpoint_base_name(file_name: &str) -> Option<&str> {
    let name = file_name.strip_suffix(".tmp").unwrap_or(file_name);
    let (base, extension) = name.rsplit_once('.')?;
    if extension != KEY_FILE_EXTENSION && extension != VALUE_FILE_EXTENSION {
        return None;
    }
    if base.starts_with(CHECKPOINT_FILE_PREFIX) || base.starts_with(MERGED_FILE_PREFIX) {
        Some(base)
    } else {
        None
    }
}
