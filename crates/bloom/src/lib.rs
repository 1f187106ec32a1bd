//! # Bloom Filter
//!
//! Probabilistic key-membership filter shared by the checkpoint and store
//! crates. A negative answer is exact; a positive answer may be a false
//! positive at roughly the configured rate.
//!
//! ## Where it is used
//!
//! - Every checkpoint key file embeds a filter over its keys so that point
//!   lookups against a file that cannot hold the key skip the index entirely.
//! - Every `FileMetadata` keeps a filter over the keys that have been
//!   invalidated in that file. File merge consults it to decide whether a
//!   tombstone must be carried forward. A false positive only keeps a
//!   tombstone alive one merge longer.
//!
//! ```rust,no_run
//! use bloom::BloomFilter;
//!
//! let mut bf = BloomFilter::new(1000, 0.01);
//! bf.insert(b"hello");
//! assert!(bf.may_contain(b"hello"));
//! assert_eq!(bf.len(), 1);
//! ```
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Upper bound on the serialized bit array accepted by [`BloomFilter::read_from`].
const MAX_FILTER_BYTES: usize = 128 * 1024 * 1024;

/// Bit-vector bloom filter with `k` bit positions per key derived by double hashing.
#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
    /// Number of `insert` calls, duplicates included.
    inserted: u64,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` keys at `false_positive_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `expected_items` is 0 or `false_positive_rate` is not in `(0, 1)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        assert!(expected_items > 0, "expected_items must be > 0");
        assert!(
            false_positive_rate > 0.0 && false_positive_rate < 1.0,
            "false_positive_rate must be in (0, 1)"
        );

        let n = expected_items as f64;
        let ln2 = std::f64::consts::LN_2;
        // m = -n ln(p) / ln(2)^2, k = m/n ln(2)
        let num_bits = ((-n * false_positive_rate.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).ceil().max(1.0) as u32;

        Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
            inserted: 0,
        }
    }

    /// Adds `key` to the filter.
    pub fn insert(&mut self, key: &[u8]) {
        let num_bits = self.num_bits;
        for bit in BitPositions::new(key, self.num_hashes, num_bits) {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
        self.inserted += 1;
    }

    /// `false` means `key` was never inserted.
    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        BitPositions::new(key, self.num_hashes, self.num_bits)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Number of insertions performed so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inserted
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    /// Size of [`write_to`](Self::write_to) output in bytes.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        8 + 4 + 8 + 4 + self.bits.len()
    }

    /// Serializes the filter.
    ///
    /// ```text
    /// [num_bits: u64][num_hashes: u32][inserted: u64][bits_len: u32][bits]
    /// ```
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.num_bits)?;
        w.write_u32::<LittleEndian>(self.num_hashes)?;
        w.write_u64::<LittleEndian>(self.inserted)?;
        w.write_u32::<LittleEndian>(self.bits.len() as u32)?;
        w.write_all(&self.bits)
    }

    /// Reads a filter written by [`write_to`](Self::write_to).
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let num_bits = r.read_u64::<LittleEndian>()?;
        let num_hashes = r.read_u32::<LittleEndian>()?;
        let inserted = r.read_u64::<LittleEndian>()?;
        let bits_len = r.read_u32::<LittleEndian>()? as usize;

        if bits_len > MAX_FILTER_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bloom filter too large: {} bytes", bits_len),
            ));
        }
        if num_bits == 0 || num_bits > (bits_len as u64) * 8 || num_hashes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "inconsistent bloom filter header: num_bits={} bits_len={} num_hashes={}",
                    num_bits, bits_len, num_hashes
                ),
            ));
        }

        let mut bits = vec![0u8; bits_len];
        r.read_exact(&mut bits)?;

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
            inserted,
        })
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("inserted", &self.inserted)
            .finish()
    }
}

/// Bit positions tested for one key: `(h1 + i * h2) mod num_bits`.
struct BitPositions {
    h1: u64,
    h2: u64,
    i: u32,
    k: u32,
    num_bits: u64,
}

impl BitPositions {
    fn new(key: &[u8], k: u32, num_bits: u64) -> Self {
        Self {
            h1: fnv1a_64(key, 0xcbf2_9ce4_8422_2325),
            // An odd step visits distinct positions for power-of-two sizes.
            h2: fnv1a_64(key, 0x517c_c1b7_2722_0a95) | 1,
            i: 0,
            k,
            num_bits,
        }
    }
}

impl Iterator for BitPositions {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.i == self.k {
            return None;
        }
        let bit = self
            .h1
            .wrapping_add(u64::from(self.i).wrapping_mul(self.h2))
            % self.num_bits;
        self.i += 1;
        Some(bit)
    }
}

fn fnv1a_64(data: &[u8], basis: u64) -> u64 {
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter()
        .fold(basis, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}
