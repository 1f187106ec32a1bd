//! Checkpoint file format constants and footer read/write helpers.
//!
//! ## Key file footer (44 bytes) - magic `SDK1` (`0x5344_4B31`)
//!
//! ```text
//! [file_id: u32][timestamp: u64][key_count: u64][deleted_count: u64]
//! [bloom_offset: u64][index_offset: u64][magic: u32]
//! ```
//!
//! ## Value file footer (12 bytes) - magic `SDV1` (`0x5344_5631`)
//!
//! ```text
//! [value_count: u64][magic: u32]
//! ```
//!
//! The reader checks the trailing magic before trusting any offset.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Result as IoResult, Seek, SeekFrom, Write};

/// Magic number of key files (ASCII "SDK1").
pub const KEY_FILE_MAGIC: u32 = 0x5344_4B31;

/// Magic number of value files (ASCII "SDV1").
pub const VALUE_FILE_MAGIC: u32 = 0x5344_5631;

pub const KEY_FOOTER_BYTES: u64 = 4 + 8 + 8 + 8 + 8 + 8 + 4;
pub const VALUE_FOOTER_BYTES: u64 = 8 + 4;

/// Extension of the key half of a checkpoint file pair.
/// Largest key a checkpoint file accepts (64 KiB). Readers refuse to
/// allocate more, so corrupt lengths cannot exhaust memory.
pub const MAX_KEY_BYTES: usize = 64 * 1024;
/// Largest value a checkpoint file accepts (64 MiB).
pub const MAX_VALUE_BYTES: usize = 64 * 1024 * 1024;

pub const KEY_FILE_EXTENSION: &str = "sdk";
/// Extension of the value half of a checkpoint file pair.
pub const VALUE_FILE_EXTENSION: &str = "sdv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyFileFooter {
    pub file_id: u32,
    pub timestamp: u64,
    pub key_count: u64,
    pub deleted_count: u64,
    pub bloom_offset: u64,
    pub index_offset: u64,
}

impl KeyFileFooter {
    pub fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        w.write_u32::<LittleEndian>(self.file_id)?;
        w.write_u64::<LittleEndian>(self.timestamp)?;
        w.write_u64::<LittleEndian>(self.key_count)?;
        w.write_u64::<LittleEndian>(self.deleted_count)?;
        w.write_u64::<LittleEndian>(self.bloom_offset)?;
        w.write_u64::<LittleEndian>(self.index_offset)?;
        w.write_u32::<LittleEndian>(KEY_FILE_MAGIC)?;
        Ok(())
    }

    /// Reads the footer from the end of `r`. The cursor ends up at EOF.
    pub fn read_from<R: Read + Seek>(r: &mut R) -> IoResult<Self> {
        let filesize = r.seek(SeekFrom::End(0))?;
        if filesize < KEY_FOOTER_BYTES {
            return Err(invalid("file too small for key file footer"));
        }
        r.seek(SeekFrom::End(-4))?;
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != KEY_FILE_MAGIC {
            return Err(invalid(format!("unknown key file magic: {:#x}", magic)));
        }
        r.seek(SeekFrom::End(-(KEY_FOOTER_BYTES as i64)))?;
        let footer = Self {
            file_id: r.read_u32::<LittleEndian>()?,
            timestamp: r.read_u64::<LittleEndian>()?,
            key_count: r.read_u64::<LittleEndian>()?,
            deleted_count: r.read_u64::<LittleEndian>()?,
            bloom_offset: r.read_u64::<LittleEndian>()?,
            index_offset: r.read_u64::<LittleEndian>()?,
        };
        let data_end = filesize - KEY_FOOTER_BYTES;
        if footer.bloom_offset > footer.index_offset || footer.index_offset > data_end {
            return Err(invalid("key file section offsets out of range"));
        }
        Ok(footer)
    }
}

pub fn write_value_footer<W: Write>(w: &mut W, value_count: u64) -> IoResult<()> {
    w.write_u64::<LittleEndian>(value_count)?;
    w.write_u32::<LittleEndian>(VALUE_FILE_MAGIC)?;
    Ok(())
}

/// Returns the value count stored in the value file footer.
pub fn read_value_footer<R: Read + Seek>(r: &mut R) -> IoResult<u64> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < VALUE_FOOTER_BYTES {
        return Err(invalid("file too small for value file footer"));
    }
    r.seek(SeekFrom::End(-(VALUE_FOOTER_BYTES as i64)))?;
    let value_count = r.read_u64::<LittleEndian>()?;
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != VALUE_FILE_MAGIC {
        return Err(invalid(format!("unknown value file magic: {:#x}", magic)));
    }
    Ok(value_count)
}

fn invalid<E: Into<Box<dyn std::error::Error + Send + Sync>>>(msg: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}
