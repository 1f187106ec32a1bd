use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use config::StoreConfig;
use differential::SharedComparer;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StoreError};
use crate::merge_helper::MergeHelper;
use crate::metadata::{FileArena, FileIds, MetadataTable};

/// State shared by the store and its consolidation manager.
pub(crate) struct StoreContext {
    pub config: StoreConfig,
    pub comparer: SharedComparer,
    pub arena: Arc<FileArena>,
    pub ids: FileIds,
    pub merge_helper: MergeHelper,
    /// Table holding the output of a merge whose result has not been
    /// folded into the next metadata table yet.
    pub merge_table: ArcSwapOption<MetadataTable>,
    /// Shared by checkpoint and consolidation, exclusive for clear and
    /// close.
    prime_lock: RwLock<()>,
}

impl StoreContext {
    pub fn new(config: StoreConfig, comparer: SharedComparer) -> Self {
        let arena = Arc::new(FileArena::new(config.trace_type.clone()));
        let merge_helper = MergeHelper::new(config.merge.clone());
        Self {
            config,
            comparer,
            arena,
            ids: FileIds::default(),
            merge_helper,
            merge_table: ArcSwapOption::const_empty(),
            prime_lock: RwLock::new(()),
        }
    }

    pub fn trace_type(&self) -> &str {
        &self.config.trace_type
    }

    pub fn acquire_prime_shared(
        &self,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<RwLockReadGuard<'_, ()>> {
        self.prime_lock
            .try_read_for(timeout)
            .ok_or(StoreError::Timeout {
                operation,
                millis: timeout.as_millis() as u64,
            })
    }

    pub fn acquire_prime_exclusive(
        &self,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<RwLockWriteGuard<'_, ()>> {
        self.prime_lock
            .try_write_for(timeout)
            .ok_or(StoreError::Timeout {
                operation,
                millis: timeout.as_millis() as u64,
            })
    }

    /// Replaces the merge table, releasing the previous one.
    pub fn set_merge_table(&self, table: Option<Arc<MetadataTable>>) {
        if let Some(previous) = self.merge_table.swap(table) {
            previous.release_ref();
        }
    }
}

pub(crate) const CHECKPOINT_FILE_PREFIX: &str = "ckpt-";
pub(crate) const MERGED_FILE_PREFIX: &str = "merge-";

pub(crate) fn checkpoint_file_name(file_id: u32) -> String {
    format!("{}{:010}", CHECKPOINT_FILE_PREFIX, file_id)
}

pub(crate) fn merged_file_name(file_id: u32) -> String {
    format!("{}{:010}", MERGED_FILE_PREFIX, file_id)
}
