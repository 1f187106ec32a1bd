//! Merge iterator over multiple [`KeyFileEnumerator`]s.
//!
//! Produces entries in ascending key order. When the same key appears in
//! more than one file, the entry with the **highest sequence number** is
//! emitted and the older ones are handed back as `skipped` so the caller can
//! account for them.
//!
//! Every source enumerator is owned by the iterator; dropping it (including
//! on early exit or cancellation) closes all input files.

use anyhow::Result;
use differential::SharedComparer;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::reader::{KeyEntry, KeyFileEnumerator};

/// The head entry of one source.
struct HeapEntry {
    entry: KeyEntry,
    /// Index into `sources`.
    source: usize,
    comparer: SharedComparer,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: smallest key first, then newest seq,
        // then lowest source index.
        self.comparer
            .compare(&other.entry.key, &self.entry.key)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// The winning entry for one key.
#[derive(Debug)]
pub struct MergedEntry {
    pub entry: KeyEntry,
    /// Older entries for the same key, newest first.
    pub skipped: Vec<KeyEntry>,
}

pub struct MergeIterator {
    sources: Vec<KeyFileEnumerator>,
    heap: BinaryHeap<HeapEntry>,
    comparer: SharedComparer,
}

impl MergeIterator {
    /// Primes the heap with the first entry of every source.
    pub fn new(sources: Vec<KeyFileEnumerator>, comparer: SharedComparer) -> Result<Self> {
        let mut iter = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            comparer,
        };
        for source in 0..iter.sources.len() {
            iter.advance(source)?;
        }
        Ok(iter)
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                entry: next?,
                source,
                comparer: self.comparer.clone(),
            });
        }
        Ok(())
    }

    /// Returns the next key's winning entry, or `None` when all sources are
    /// exhausted.
    pub fn next_entry(&mut self) -> Result<Option<MergedEntry>> {
        let Some(top) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(top.source)?;

        let mut skipped = Vec::new();
        while let Some(peek) = self.heap.peek() {
            if self.comparer.compare(&peek.entry.key, &top.entry.key) != Ordering::Equal {
                break;
            }
            if let Some(dup) = self.heap.pop() {
                self.advance(dup.source)?;
                skipped.push(dup.entry);
            }
        }

        Ok(Some(MergedEntry {
            entry: top.entry,
            skipped,
        }))
    }

    /// Collects all remaining entries into a `Vec`.
    pub fn collect_all(&mut self) -> Result<Vec<MergedEntry>> {
        let mut result = Vec::new();
        while let Some(merged) = self.next_entry()? {
            result.push(merged);
        }
        Ok(result)
    }
}

impl Iterator for MergeIterator {
    type Item = Result<MergedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
