//! File merge: rewrite several checkpoint files as one.
//!
//! Runs at the end of a consolidation, against the consolidated component
//! that consolidation just built. For every key in the input files the
//! newest entry is examined:
//!
//! | newest consolidated record      | action                                        |
//! |---------------------------------|-----------------------------------------------|
//! | absent (key deleted)            | keep the tombstone only if an older file outside the merge still lists the key as invalid |
//! | lives in the same file          | copy forward, re-point the consolidated record |
//! | lives in another file           | drop, the entry is stale                       |
//!
//! Inputs are read at [`IoPriority::Low`].

use std::sync::Arc;

use checkpoint::{CheckpointWriter, IoPriority, KeyEntry, MergeIterator, MergedEntry};

use crate::consolidated::ConsolidatedComponent;
use crate::context::{merged_file_name, StoreContext};
use crate::error::{CancellationToken, Result};
use crate::metadata::{FileMetadata, MetadataTable};
use crate::store_assert;

/// What a merge produced, folded into the next metadata table by the
/// checkpoint that picks it up.
#[derive(Debug, Clone)]
pub struct PostMergeMetadataInfo {
    /// Every input file. All of them are obsolete once the result is
    /// applied.
    pub deleted_file_ids: Vec<u32>,
    /// `None` when nothing survived.
    pub merged_file: Option<Arc<FileMetadata>>,
}

#[derive(Debug, Default)]
struct MergeStats {
    written: u64,
    stale: u64,
    dropped_tombstones: u64,
    oldest_deleted: u64,
    latest_deleted: u64,
}

impl MergeStats {
    fn track_tombstone(&mut self, timestamp: u64) {
        if self.oldest_deleted == 0 || timestamp < self.oldest_deleted {
            self.oldest_deleted = timestamp;
        }
        if timestamp > self.latest_deleted {
            self.latest_deleted = timestamp;
        }
    }
}

/// Merges `file_ids` (all listed in `table`) into one new file.
///
/// Live keys written to the new file are re-pointed in `new_consolidated`
/// with copy-on-write records. On error or cancellation the partial output
/// is removed; the inputs are untouched.
pub(crate) fn merge_files(
    ctx: &StoreContext,
    table: &MetadataTable,
    file_ids: &[u32],
    new_consolidated: &ConsolidatedComponent,
    cancel: &CancellationToken,
) -> Result<PostMergeMetadataInfo> {
    let mut sources = Vec::with_capacity(file_ids.len());
    let mut expected = 0usize;
    for &file_id in file_ids {
        let metadata = table.require(file_id);
        tracing::debug!(
            trace_type = ctx.trace_type(),
            file_id,
            total = metadata.total_entries(),
            deleted = metadata.deleted_entries(),
            invalid = metadata.invalid_entries(),
            "selected for merge"
        );
        expected += metadata.total_entries() as usize;
        sources.push(metadata.file().enumerate(IoPriority::Low)?);
    }
    let mut merged = MergeIterator::new(sources, ctx.comparer.clone())?;

    let file_id = ctx.ids.increment_file_id();
    let timestamp = ctx.ids.next_checkpoint_file_timestamp();
    let name = merged_file_name(file_id);
    let mut writer = CheckpointWriter::create(
        &ctx.config.working_dir,
        &name,
        file_id,
        timestamp,
        expected,
        ctx.comparer.clone(),
        IoPriority::Low,
    )?;

    let mut stats = MergeStats::default();
    let outcome = write_survivors(
        table,
        file_ids,
        new_consolidated,
        cancel,
        &mut merged,
        &mut writer,
        &mut stats,
    );
    drop(merged);
    if let Err(e) = outcome {
        writer.abandon();
        return Err(e);
    }

    let merged_file = if stats.written == 0 {
        writer.abandon();
        None
    } else {
        let file = writer.finish()?;
        let metadata = Arc::new(FileMetadata::new(
            file,
            stats.oldest_deleted,
            stats.latest_deleted,
        ));
        let mut merge_table = MetadataTable::new(Arc::clone(&ctx.arena), table.checkpoint_lsn());
        merge_table.add_file(Arc::clone(&metadata));
        ctx.set_merge_table(Some(Arc::new(merge_table)));
        Some(metadata)
    };

    tracing::info!(
        trace_type = ctx.trace_type(),
        inputs = ?file_ids,
        merged_file_id = merged_file.as_ref().map(|m| m.file_id()),
        written = stats.written,
        stale = stats.stale,
        dropped_tombstones = stats.dropped_tombstones,
        "merged checkpoint files"
    );

    Ok(PostMergeMetadataInfo {
        deleted_file_ids: file_ids.to_vec(),
        merged_file,
    })
}

fn write_survivors(
    table: &MetadataTable,
    file_ids: &[u32],
    new_consolidated: &ConsolidatedComponent,
    cancel: &CancellationToken,
    merged: &mut MergeIterator,
    writer: &mut CheckpointWriter,
    stats: &mut MergeStats,
) -> Result<()> {
    while let Some(MergedEntry { entry, skipped }) = merged.next_entry()? {
        cancel.check()?;
        for dup in &skipped {
            store_assert!(
                dup.seq <= entry.seq,
                "merge skipped seq {} in favour of older seq {}",
                dup.seq,
                entry.seq
            );
        }

        match new_consolidated.read(&entry.key) {
            None => {
                if retain_tombstone(table, file_ids, &entry) {
                    writer.append(&entry.key, entry.kind, entry.seq, entry.timestamp, None)?;
                    stats.written += 1;
                    stats.track_tombstone(entry.timestamp);
                } else {
                    stats.dropped_tombstones += 1;
                }
            }
            Some(latest) if latest.file_id() == entry.location.file_id => {
                store_assert!(
                    latest.seq() == entry.seq,
                    "merged entry seq {} does not match consolidated seq {}",
                    entry.seq,
                    latest.seq()
                );
                let value = if entry.is_deleted() {
                    None
                } else {
                    match latest.value() {
                        Some(cached) => Some(cached),
                        None => Some(
                            table
                                .require(entry.location.file_id)
                                .file()
                                .read_value(entry.location)?,
                        ),
                    }
                };
                let location = writer.append(
                    &entry.key,
                    entry.kind,
                    entry.seq,
                    entry.timestamp,
                    value.as_deref(),
                )?;
                stats.written += 1;
                if entry.is_deleted() {
                    stats.track_tombstone(entry.timestamp);
                } else {
                    new_consolidated.update(&entry.key, Arc::new(latest.with_location(location)));
                }
            }
            Some(_) => stats.stale += 1,
        }
    }
    Ok(())
}

/// A tombstone whose key is gone from the consolidated component stays
/// only while some older file outside the merge may still list the key.
fn retain_tombstone(table: &MetadataTable, file_ids: &[u32], entry: &KeyEntry) -> bool {
    for file in table.files() {
        if file.timestamp() >= entry.timestamp {
            continue;
        }
        // Only tombstones carry a non-zero timestamp.
        store_assert!(
            entry.is_deleted(),
            "live entry with timestamp {} found during merge",
            entry.timestamp
        );
        if !file_ids.contains(&file.file_id())
            && file.invalid_entries() > 0
            && file.contains_invalid_key(&entry.key)
        {
            return true;
        }
    }
    false
}
