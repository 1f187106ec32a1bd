
use crate::*;
use anyhow::Result;
use differential::{bytewise, VersionedRecord};
use std::path::Path;
use std::sync::Arc;

/// Writes `(key, value-or-tombstone, seq)` triples as checkpoint `name`.
pub(crate) fn write_file(
    dir: &Path,
    name: &str,
    file_id: u32,
    timestamp: u64,
    entries: &[(&[u8], Option<&[u8]>, u64)],
) -> Result<CheckpointFile> {
    let items: Vec<(Vec<u8>, Arc<VersionedRecord>)> = entries
        .iter()
        .map(|&(k, v, seq)| {
            let record = match v {
                Some(v) => VersionedRecord::inserted(seq, v.to_vec()),
                None => VersionedRecord::deleted(seq),
            };
            (k.to_vec(), Arc::new(record))
        })
        .collect();
    CheckpointFile::create(
        dir,
        name,
        file_id,
        timestamp,
        items.len(),
        bytewise(),
        IoPriority::Normal,
        items,
    )
}
