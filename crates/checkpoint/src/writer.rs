use anyhow::{bail, Context, Result};
use bloom::BloomFilter;
use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use differential::{RecordKind, SharedComparer, ValueLocation, VersionedRecord};
use std::cmp::Ordering;
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::format::{write_value_footer, KeyFileFooter, MAX_KEY_BYTES, MAX_VALUE_BYTES};
use crate::reader::CheckpointFile;
use crate::{key_file_path, value_file_path, IoPriority};

/// Default bloom filter false positive rate (1%).
const BLOOM_FPR: f64 = 0.01;

/// Streams key-ordered entries into a new checkpoint file pair.
///
/// Both halves are written to `*.tmp` files first. [`finish`](Self::finish)
/// fsyncs them, renames them into place and opens the result. A writer that
/// is dropped or [`abandon`](Self::abandon)ed leaves no visible files behind
/// (stray temp files are swept up by recovery).
pub struct CheckpointWriter {
    dir: PathBuf,
    name: String,
    file_id: u32,
    timestamp: u64,
    comparer: SharedComparer,
    priority: IoPriority,
    key_tmp: PathBuf,
    value_tmp: PathBuf,
    keys: BufWriter<File>,
    values: BufWriter<File>,
    bloom: BloomFilter,
    index: Vec<(Vec<u8>, u64)>,
    last_key: Option<Vec<u8>>,
    deleted_count: u64,
    value_count: u64,
    record_buf: Vec<u8>,
}

impl CheckpointWriter {
    /// Opens temp files for `<dir>/<name>.sdk` / `.sdv`.
    ///
    /// `expected_count` sizes the bloom filter; over-estimating is safe.
    pub fn create(
        dir: &Path,
        name: &str,
        file_id: u32,
        timestamp: u64,
        expected_count: usize,
        comparer: SharedComparer,
        priority: IoPriority,
    ) -> Result<Self> {
        let key_tmp = tmp_path(&key_file_path(dir, name));
        let value_tmp = tmp_path(&value_file_path(dir, name));
        let open = |p: &Path| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(p)
                .with_context(|| format!("creating {}", p.display()))
        };
        let keys = BufWriter::new(open(&key_tmp)?);
        let values = BufWriter::new(open(&value_tmp)?);

        tracing::debug!(file_id, name, ?priority, "writing checkpoint file");

        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            file_id,
            timestamp,
            comparer,
            priority,
            key_tmp,
            value_tmp,
            keys,
            values,
            bloom: BloomFilter::new(expected_count.max(1), BLOOM_FPR),
            index: Vec::with_capacity(expected_count),
            last_key: None,
            deleted_count: 0,
            value_count: 0,
            record_buf: Vec::with_capacity(256),
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn key_count(&self) -> u64 {
        self.index.len() as u64
    }

    /// Appends one key. Keys must arrive in strictly ascending order.
    ///
    /// `value` must be `Some` for live records and is ignored for tombstones.
    /// Returns where the value landed in the value file.
    pub fn append(
        &mut self,
        key: &[u8],
        kind: RecordKind,
        seq: u64,
        timestamp: u64,
        value: Option<&[u8]>,
    ) -> Result<ValueLocation> {
        let key_len = checked_len(key.len(), MAX_KEY_BYTES, "key")?;
        if let Some(last) = &self.last_key {
            if self.comparer.compare(last, key) != Ordering::Less {
                bail!("checkpoint keys must be strictly ascending");
            }
        }

        let location = if kind == RecordKind::Deleted {
            self.deleted_count += 1;
            ValueLocation::new(self.file_id, 0, 0)
        } else {
            let Some(value) = value else {
                bail!("live record at seq {} has no value to checkpoint", seq);
            };
            let value_len = checked_len(value.len(), MAX_VALUE_BYTES, "value")?;
            let offset = self.values.stream_position()?;
            let mut hasher = Crc32::new();
            hasher.update(value);
            self.values.write_u32::<LittleEndian>(hasher.finalize())?;
            self.values.write_u32::<LittleEndian>(value_len)?;
            self.values.write_all(value)?;
            self.value_count += 1;
            ValueLocation::new(self.file_id, offset, value_len)
        };

        // [crc32][key_len][key][seq][kind][timestamp][value_offset][value_size]
        self.record_buf.clear();
        self.record_buf.write_u32::<LittleEndian>(key_len)?;
        self.record_buf.extend_from_slice(key);
        self.record_buf.write_u64::<LittleEndian>(seq)?;
        self.record_buf.write_u8(kind.as_u8())?;
        self.record_buf.write_u64::<LittleEndian>(timestamp)?;
        self.record_buf.write_u64::<LittleEndian>(location.offset)?;
        self.record_buf.write_u32::<LittleEndian>(location.size)?;

        let mut hasher = Crc32::new();
        hasher.update(&self.record_buf);

        let offset = self.keys.stream_position()?;
        self.keys.write_u32::<LittleEndian>(hasher.finalize())?;
        self.keys.write_all(&self.record_buf)?;

        self.bloom.insert(key);
        self.index.push((key.to_vec(), offset));
        self.last_key = Some(key.to_vec());
        Ok(location)
    }

    /// Seals both files, moves them into place and opens the result.
    pub fn finish(mut self) -> Result<CheckpointFile> {
        let bloom_offset = self.keys.stream_position()?;
        self.bloom.write_to(&mut self.keys)?;

        let index_offset = self.keys.stream_position()?;
        for (key, data_offset) in &self.index {
            self.keys.write_u32::<LittleEndian>(checked_len(key.len(), MAX_KEY_BYTES, "key")?)?;
            self.keys.write_all(key)?;
            self.keys.write_u64::<LittleEndian>(*data_offset)?;
        }

        KeyFileFooter {
            file_id: self.file_id,
            timestamp: self.timestamp,
            key_count: self.index.len() as u64,
            deleted_count: self.deleted_count,
            bloom_offset,
            index_offset,
        }
        .write_to(&mut self.keys)?;
        write_value_footer(&mut self.values, self.value_count)?;

        self.keys.flush()?;
        self.values.flush()?;
        self.keys.into_inner()?.sync_all()?;
        self.values.into_inner()?.sync_all()?;

        // Value file first: a key file never points into a missing value file.
        rename(&self.value_tmp, value_file_path(&self.dir, &self.name))?;
        rename(&self.key_tmp, key_file_path(&self.dir, &self.name))?;

        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        tracing::debug!(
            file_id = self.file_id,
            keys = self.index.len(),
            deleted = self.deleted_count,
            priority = ?self.priority,
            "checkpoint file sealed"
        );

        CheckpointFile::open(&self.dir, &self.name, self.comparer)
    }

    /// Discards the partially written temp files.
    pub fn abandon(self) {
        let CheckpointWriter {
            keys,
            values,
            key_tmp,
            value_tmp,
            ..
        } = self;
        drop(keys);
        drop(values);
        let _ = std::fs::remove_file(key_tmp);
        let _ = std::fs::remove_file(value_tmp);
    }
}

impl CheckpointFile {
    /// Writes `items` (ascending by key) as a new checkpoint file pair.
    ///
    /// Tombstones that have never been checkpointed are stamped with
    /// `timestamp`. Once the files are durable every record is pointed at
    /// its new location.
    #[allow(clippy::too_many_arguments)]
    pub fn create<I>(
        dir: &Path,
        name: &str,
        file_id: u32,
        timestamp: u64,
        expected_count: usize,
        comparer: SharedComparer,
        priority: IoPriority,
        items: I,
    ) -> Result<CheckpointFile>
    where
        I: IntoIterator<Item = (Vec<u8>, Arc<VersionedRecord>)>,
    {
        let mut writer = CheckpointWriter::create(
            dir,
            name,
            file_id,
            timestamp,
            expected_count,
            comparer,
            priority,
        )?;
        let mut placed = Vec::with_capacity(expected_count);
        for (key, record) in items {
            if record.is_deleted() {
                record.set_timestamp_if_unset(timestamp);
            }
            let value = record.value();
            let appended = writer.append(
                &key,
                record.kind(),
                record.seq(),
                record.timestamp(),
                value.as_deref(),
            );
            match appended {
                Ok(location) => placed.push((record, location)),
                Err(e) => {
                    writer.abandon();
                    return Err(e);
                }
            }
        }
        let file = writer.finish()?;
        for (record, location) in placed {
            record.set_location(location);
        }
        Ok(file)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// `len` as a stored `u32` length, refusing anything above `max`.
fn checked_len(len: usize, max: usize, what: &str) -> Result<u32> {
    if len > max {
        bail!("{} of {} bytes exceeds the maximum of {}", what, len, max);
    }
    u32::try_from(len).with_context(|| format!("{} length {} does not fit in u32", what, len))
}
