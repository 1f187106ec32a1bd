//! # Metadata manager - persisted metadata table
//!
//! The current metadata table is persisted as a small text file so that
//! recovery knows which checkpoint files make up the store:
//!
//! ```text
//! # tstore metadata table
//! # Format: file=<id> name=<name> total=<n> deleted=<n> timestamp=<t> oldest_deleted=<t> latest_deleted=<t>
//! checkpoint_lsn=42
//! file=3 name=ckpt-0000000003 total=10 deleted=1 timestamp=3 oldest_deleted=0 latest_deleted=0
//! file=7 name=merge-0000000007 total=25 deleted=2 timestamp=6 oldest_deleted=2 latest_deleted=4
//! ```
//!
//! Lines starting with `#` are comments. Empty lines are ignored.
//!
//! ## Replacement protocol
//!
//! `perform_checkpoint` writes the next table to `metadata.tbl.tmp`;
//! `complete_checkpoint` swaps it in with [`MetadataManager::safe_file_replace`]:
//!
//! ```text
//! current -> backup,  temp -> current,  fsync dir,  remove backup
//! ```
//!
//! [`MetadataManager::recover_file_replace`] finishes or rolls back an
//! interrupted replacement before the table is read.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::metadata::MetadataTable;

pub const METADATA_FILE_NAME: &str = "metadata.tbl";
const TEMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = ".bkp";

/// Persisted descriptor of one checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_id: u32,
    pub file_name: String,
    pub total_entries: u64,
    pub deleted_entries: u64,
    pub timestamp: u64,
    pub oldest_deleted_timestamp: u64,
    pub latest_deleted_timestamp: u64,
}

/// Contents of a metadata table file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedTable {
    pub checkpoint_lsn: u64,
    pub files: Vec<FileRecord>,
}

/// Locations of the current, temporary and backup table files.
#[derive(Debug, Clone)]
pub struct MetadataPaths {
    pub current: PathBuf,
    pub temp: PathBuf,
    pub backup: PathBuf,
}

impl MetadataPaths {
    pub fn in_dir(dir: &Path) -> Self {
        let current = dir.join(METADATA_FILE_NAME);
        Self {
            temp: dir.join(format!("{}{}", METADATA_FILE_NAME, TEMP_SUFFIX)),
            backup: dir.join(format!("{}{}", METADATA_FILE_NAME, BACKUP_SUFFIX)),
            current,
        }
    }
}

pub struct MetadataManager;

impl MetadataManager {
    /// Writes `table` to `path` and fsyncs it.
    pub fn write(table: &MetadataTable, path: &Path) -> Result<()> {
        let records: Vec<FileRecord> = table.files().map(|m| m.record()).collect();
        Self::write_records(table.checkpoint_lsn(), &records, path)
    }

    pub fn write_records(checkpoint_lsn: u64, files: &[FileRecord], path: &Path) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create metadata table at {}", path.display()))?;

        writeln!(f, "# tstore metadata table")?;
        writeln!(
            f,
            "# Format: file=<id> name=<name> total=<n> deleted=<n> timestamp=<t> oldest_deleted=<t> latest_deleted=<t>"
        )?;
        writeln!(f, "checkpoint_lsn={}", checkpoint_lsn)?;
        for r in files {
            writeln!(
                f,
                "file={} name={} total={} deleted={} timestamp={} oldest_deleted={} latest_deleted={}",
                r.file_id,
                r.file_name,
                r.total_entries,
                r.deleted_entries,
                r.timestamp,
                r.oldest_deleted_timestamp,
                r.latest_deleted_timestamp
            )?;
        }
        f.flush()?;
        f.sync_all()?;
        Ok(())
    }

    /// Parses a metadata table file.
    ///
    /// # Errors
    ///
    /// The file cannot be read, a line is malformed, or a file id appears
    /// twice.
    pub fn open(path: &Path) -> Result<PersistedTable> {
        let file = File::open(path)
            .with_context(|| format!("failed to open metadata table at {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut table = PersistedTable::default();
        let mut saw_lsn = false;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line
                .with_context(|| format!("failed to read metadata line {}", line_num + 1))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Some(lsn) = trimmed.strip_prefix("checkpoint_lsn=") {
                table.checkpoint_lsn = lsn.parse().with_context(|| {
                    format!("metadata line {}: bad checkpoint lsn '{}'", line_num + 1, lsn)
                })?;
                saw_lsn = true;
                continue;
            }

            let record = parse_file_line(trimmed)
                .with_context(|| format!("metadata line {}: {}", line_num + 1, trimmed))?;
            if table.files.iter().any(|r| r.file_id == record.file_id) {
                bail!(
                    "metadata line {}: file id {} listed twice",
                    line_num + 1,
                    record.file_id
                );
            }
            table.files.push(record);
        }

        if !saw_lsn {
            bail!("metadata table {} has no checkpoint_lsn line", path.display());
        }
        Ok(table)
    }

    /// Atomically replaces `current` with `temp`, keeping `backup` until
    /// the rename is durable.
    pub fn safe_file_replace(current: &Path, temp: &Path, backup: &Path) -> Result<()> {
        remove_if_exists(backup)?;
        if current.exists() {
            fs::rename(current, backup).with_context(|| {
                format!("failed to move {} to {}", current.display(), backup.display())
            })?;
        }
        fs::rename(temp, current).with_context(|| {
            format!("failed to move {} to {}", temp.display(), current.display())
        })?;
        if let Some(parent) = current.parent() {
            sync_dir(parent)?;
        }
        remove_if_exists(backup)
    }

    /// Repairs the result of a crash inside [`safe_file_replace`](Self::safe_file_replace).
    ///
    /// | current | temp | backup | action                              |
    /// |---------|------|--------|-------------------------------------|
    /// | yes     | any  | any    | drop backup                          |
    /// | no      | yes  | yes    | temp was complete: promote it        |
    /// | no      | no   | yes    | promote backup                       |
    /// | no      | yes  | no     | first write never finished: drop temp |
    pub fn recover_file_replace(current: &Path, temp: &Path, backup: &Path) -> Result<()> {
        if current.exists() {
            return remove_if_exists(backup);
        }
        match (temp.exists(), backup.exists()) {
            (true, true) => {
                fs::rename(temp, current)?;
                remove_if_exists(backup)?;
            }
            (false, true) => fs::rename(backup, current)?,
            (true, false) => remove_if_exists(temp)?,
            (false, false) => {}
        }
        if let Some(parent) = current.parent() {
            sync_dir(parent)?;
        }
        Ok(())
    }
}

fn parse_file_line(line: &str) -> Result<FileRecord> {
    let fields: HashMap<&str, &str> = line
        .split_whitespace()
        .map(|pair| {
            pair.split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected key=value, got '{}'", pair))
        })
        .collect::<Result<_>>()?;

    let get = |key: &str| -> Result<&str> {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("missing field '{}'", key))
    };
    let number = |key: &str| -> Result<u64> {
        let raw = get(key)?;
        raw.parse()
            .with_context(|| format!("field '{}' is not a number: '{}'", key, raw))
    };

    let file_id = number("file")?;
    if file_id == 0 || file_id > u64::from(u32::MAX) {
        bail!("file id {} out of range", file_id);
    }
    Ok(FileRecord {
        file_id: file_id as u32,
        file_name: get("name")?.to_string(),
        total_entries: number("total")?,
        deleted_entries: number("deleted")?,
        timestamp: number("timestamp")?,
        oldest_deleted_timestamp: number("oldest_deleted")?,
        latest_deleted_timestamp: number("latest_deleted")?,
    })
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)
            .and_then(|d| d.sync_all())
            .with_context(|| format!("failed to fsync {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
