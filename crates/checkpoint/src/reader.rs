use anyhow::{bail, Context, Result};
use bloom::BloomFilter;
use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use differential::{RecordKind, SharedComparer, ValueLocation, VersionedRecord};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::format::{read_value_footer, KeyFileFooter, MAX_KEY_BYTES, MAX_VALUE_BYTES};
use crate::{key_file_path, value_file_path, IoPriority};

/// One key-file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub key: Vec<u8>,
    pub kind: RecordKind,
    pub seq: u64,
    /// First-checkpoint stamp for tombstones, 0 otherwise.
    pub timestamp: u64,
    pub location: ValueLocation,
}

impl KeyEntry {
    pub fn is_deleted(&self) -> bool {
        self.kind == RecordKind::Deleted
    }

    /// Versioned record for this entry with the value left on disk.
    pub fn to_record(&self) -> VersionedRecord {
        VersionedRecord::from_checkpoint(self.kind, self.seq, self.location, self.timestamp)
    }
}

/// An open checkpoint file pair.
///
/// The key index and bloom filter are loaded on [`open`](Self::open); values
/// are read on demand through a persistent handle on the value file.
pub struct CheckpointFile {
    dir: PathBuf,
    name: String,
    footer: KeyFileFooter,
    value_count: u64,
    size_on_disk: u64,
    comparer: SharedComparer,
    bloom: BloomFilter,
    index: Vec<(Vec<u8>, u64)>,
    keys: Mutex<BufReader<File>>,
    values: Mutex<BufReader<File>>,
}

impl CheckpointFile {
    /// Opens `<dir>/<name>.sdk` and `<dir>/<name>.sdv`.
    ///
    /// # Errors
    ///
    /// Either file missing, a bad magic, offsets pointing outside the key
    /// file, or an index that is not sorted by `comparer`.
    pub fn open(dir: &Path, name: &str, comparer: SharedComparer) -> Result<Self> {
        let key_path = key_file_path(dir, name);
        let value_path = value_file_path(dir, name);
        let mut kf = File::open(&key_path)
            .with_context(|| format!("opening {}", key_path.display()))?;
        let mut vf = File::open(&value_path)
            .with_context(|| format!("opening {}", value_path.display()))?;

        let footer = KeyFileFooter::read_from(&mut kf)
            .with_context(|| format!("reading footer of {}", key_path.display()))?;
        let value_count = read_value_footer(&mut vf)
            .with_context(|| format!("reading footer of {}", value_path.display()))?;
        let size_on_disk = kf.metadata()?.len() + vf.metadata()?.len();

        kf.seek(SeekFrom::Start(footer.bloom_offset))?;
        let bloom = BloomFilter::read_from(&mut kf)?;

        let index_end = kf.metadata()?.len() - crate::format::KEY_FOOTER_BYTES;
        kf.seek(SeekFrom::Start(footer.index_offset))?;
        let mut reader = BufReader::new(kf);
        let mut index: Vec<(Vec<u8>, u64)> = Vec::with_capacity(footer.key_count as usize);
        let mut pos = footer.index_offset;
        while pos < index_end {
            let key_len = reader.read_u32::<LittleEndian>()? as usize;
            if key_len > MAX_KEY_BYTES {
                bail!("corrupt index: key_len {} exceeds maximum {}", key_len, MAX_KEY_BYTES);
            }
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;
            let data_offset = reader.read_u64::<LittleEndian>()?;
            if let Some((prev, _)) = index.last() {
                if comparer.compare(prev, &key) != Ordering::Less {
                    bail!("corrupt index: keys out of order in {}", key_path.display());
                }
            }
            index.push((key, data_offset));
            pos += 4 + key_len as u64 + 8;
        }
        if index.len() as u64 != footer.key_count {
            bail!(
                "corrupt index: {} entries, footer says {}",
                index.len(),
                footer.key_count
            );
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            footer,
            value_count,
            size_on_disk,
            comparer,
            bloom,
            index,
            keys: Mutex::new(reader),
            values: Mutex::new(BufReader::new(vf)),
        })
    }

    /// Removes both halves of a checkpoint file pair. Missing files are fine.
    pub fn delete(dir: &Path, name: &str) -> Result<()> {
        for path in [key_file_path(dir, name), value_file_path(dir, name)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("deleting {}", path.display()))
                }
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_id(&self) -> u32 {
        self.footer.file_id
    }

    /// Logical stamp of the checkpoint that produced this file.
    pub fn timestamp(&self) -> u64 {
        self.footer.timestamp
    }

    pub fn key_count(&self) -> u64 {
        self.footer.key_count
    }

    pub fn deleted_key_count(&self) -> u64 {
        self.footer.deleted_count
    }

    pub fn value_count(&self) -> u64 {
        self.value_count
    }

    /// Combined size of both files in bytes.
    pub fn size_on_disk(&self) -> u64 {
        self.size_on_disk
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Point lookup. Tombstones are returned as entries.
    pub fn get(&self, key: &[u8]) -> Result<Option<KeyEntry>> {
        if !self.bloom.may_contain(key) {
            return Ok(None);
        }
        let pos = match self
            .index
            .binary_search_by(|(k, _)| self.comparer.compare(k, key))
        {
            Ok(pos) => pos,
            Err(_) => return Ok(None),
        };
        let offset = self.index[pos].1;

        let mut f = self.keys.lock();
        f.seek(SeekFrom::Start(offset))?;
        let entry = read_key_record(&mut *f, self.footer.file_id)?;
        if entry.key != key {
            bail!("index pointed to mismatching key at offset {}", offset);
        }
        Ok(Some(entry))
    }

    /// Reads and verifies one value.
    pub fn read_value(&self, location: ValueLocation) -> Result<Arc<[u8]>> {
        if location.file_id != self.footer.file_id {
            bail!(
                "value location for file {} read from file {}",
                location.file_id,
                self.footer.file_id
            );
        }
        let mut f = self.values.lock();
        f.seek(SeekFrom::Start(location.offset))?;
        let expected_crc = f.read_u32::<LittleEndian>()?;
        let len = f.read_u32::<LittleEndian>()?;
        if len != location.size || len as usize > MAX_VALUE_BYTES {
            bail!(
                "corrupt value at offset {}: length {} (expected {})",
                location.offset,
                len,
                location.size
            );
        }
        let mut buf = vec![0u8; len as usize];
        f.read_exact(&mut buf)?;
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let actual_crc = hasher.finalize();
        if actual_crc != expected_crc {
            bail!(
                "CRC32 mismatch at offset {}: expected {:#010x}, got {:#010x} (data corruption)",
                location.offset,
                expected_crc,
                actual_crc
            );
        }
        Ok(Arc::from(buf))
    }

    /// Forward, key-ordered enumeration on a dedicated file handle.
    pub fn enumerate(&self, priority: IoPriority) -> Result<KeyFileEnumerator> {
        let path = key_file_path(&self.dir, &self.name);
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        tracing::trace!(file_id = self.footer.file_id, ?priority, "enumerating key file");
        Ok(KeyFileEnumerator {
            reader: BufReader::new(file),
            file_id: self.footer.file_id,
            remaining: self.footer.key_count,
            failed: false,
        })
    }

    /// Keys in file order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.index.iter().map(|(k, _)| k.as_slice())
    }
}

impl std::fmt::Debug for CheckpointFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointFile")
            .field("name", &self.name)
            .field("file_id", &self.footer.file_id)
            .field("timestamp", &self.footer.timestamp)
            .field("keys", &self.footer.key_count)
            .finish()
    }
}

/// Sequential reader over a key file's data section.
///
/// Owns its file handle; dropping the enumerator closes it.
pub struct KeyFileEnumerator {
    reader: BufReader<File>,
    file_id: u32,
    remaining: u64,
    failed: bool,
}

impl KeyFileEnumerator {
    pub fn file_id(&self) -> u32 {
        self.file_id
    }
}

impl Iterator for KeyFileEnumerator {
    type Item = Result<KeyEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.failed {
            return None;
        }
        self.remaining -= 1;
        let entry = read_key_record(&mut self.reader, self.file_id);
        if entry.is_err() {
            self.failed = true;
        }
        Some(entry)
    }
}

fn read_key_record<R: Read>(r: &mut R, file_id: u32) -> Result<KeyEntry> {
    let stored_crc = r.read_u32::<LittleEndian>()?;
    let key_len = r.read_u32::<LittleEndian>()?;
    if key_len as usize > MAX_KEY_BYTES {
        bail!("corrupt data: key_len {} exceeds maximum {}", key_len, MAX_KEY_BYTES);
    }
    let mut key = vec![0u8; key_len as usize];
    r.read_exact(&mut key)?;
    let seq = r.read_u64::<LittleEndian>()?;
    let raw_kind = r.read_u8()?;
    let timestamp = r.read_u64::<LittleEndian>()?;
    let offset = r.read_u64::<LittleEndian>()?;
    let size = r.read_u32::<LittleEndian>()?;

    let mut hasher = Crc32::new();
    hasher.update(&key_len.to_le_bytes());
    hasher.update(&key);
    hasher.update(&seq.to_le_bytes());
    hasher.update(&[raw_kind]);
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(&offset.to_le_bytes());
    hasher.update(&size.to_le_bytes());
    let actual_crc = hasher.finalize();
    if actual_crc != stored_crc {
        bail!(
            "CRC32 mismatch in key record: expected {:#010x}, got {:#010x} (data corruption)",
            stored_crc,
            actual_crc
        );
    }

    let Some(kind) = RecordKind::from_u8(raw_kind) else {
        bail!("corrupt data: unknown record kind {}", raw_kind);
    };
    Ok(KeyEntry {
        key,
        kind,
        seq,
        timestamp,
        location: ValueLocation::new(file_id, offset, size),
    })
}
