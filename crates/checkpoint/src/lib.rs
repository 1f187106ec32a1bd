//! # Checkpoint - on-disk checkpoint file pairs
//!
//! A checkpoint file is written once per checkpoint (or per file merge) and
//! never modified afterwards. It is a pair of files sharing a base name:
//!
//! ## Key file (`<name>.sdk`)
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA SECTION (key-ordered records)                             │
//! │                                                               │
//! │ crc32 (u32) | key_len (u32) | key | seq (u64) | kind (u8)      │
//! │ timestamp (u64) | value_offset (u64) | value_size (u32)        │
//! │                                                               │
//! │ The CRC32 covers everything after itself in the record.       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ BLOOM SECTION (serialized BloomFilter)                         │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX SECTION                                                  │
//! │ key_len (u32) | key | data_offset (u64)                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (44 bytes)                                              │
//! │ file_id | timestamp | key_count | deleted_count                │
//! │ bloom_offset | index_offset | magic "SDK1"                     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Value file (`<name>.sdv`)
//!
//! ```text
//! crc32 (u32) | value_len (u32) | value      ... one per live key
//! value_count (u64) | magic "SDV1"
//! ```
//!
//! Tombstones have no value record. All integers are little-endian.

mod format;
mod merge;
mod reader;
mod writer;

use std::path::{Path, PathBuf};

pub use format::{
    KeyFileFooter, KEY_FILE_EXTENSION, KEY_FILE_MAGIC, KEY_FOOTER_BYTES, MAX_KEY_BYTES, MAX_VALUE_BYTES,
    VALUE_FILE_EXTENSION, VALUE_FILE_MAGIC, VALUE_FOOTER_BYTES,
};
pub use merge::{MergeIterator, MergedEntry};
pub use reader::{CheckpointFile, KeyEntry, KeyFileEnumerator};
pub use writer::CheckpointWriter;

/// Scheduling hint for checkpoint I/O. Background merges run at `Low` so
/// foreground reads are not starved; the hint is carried through to logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoPriority {
    #[default]
    Normal,
    Low,
}

pub fn key_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, KEY_FILE_EXTENSION))
}

pub fn value_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, VALUE_FILE_EXTENSION))
}

#[cfg(test)]
mod tests;
