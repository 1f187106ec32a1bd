//! Consolidation: folding the delta chain into a new consolidated base.
//!
//! ```text
//!   aggregated (published)               new aggregated (pending)
//!   ┌──────────────────────────┐         ┌──────────────────────────┐
//!   │ delta 1 .. delta H       │  walk   │ consolidated'            │
//!   │ consolidated             │ ──────► │ + deltas H+1.. replayed  │
//!   └──────────────────────────┘         └──────────────────────────┘
//!              ▲                                     │
//!              └──────── reset_to_new_aggregated_state
//! ```
//!
//! The walk is a merge of every delta (newest index first for equal keys)
//! against the old consolidated component. Whatever a key loses along the
//! way is handed to version retirement so snapshot readers keep seeing it,
//! and every superseded on-disk entry is counted as invalid in its file.
//!
//! Appending deltas and installing the pending state are serialized under
//! the index lock. Everything else reads published states lock-free.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use differential::{DifferentialComponent, DifferentialVersions, SharedComparer, VersionedRecord};
use parking_lot::Mutex;

use crate::aggregated::AggregatedState;
use crate::consolidated::ConsolidatedComponent;
use crate::context::StoreContext;
use crate::error::{CancellationToken, Result};
use crate::merge::{merge_files, PostMergeMetadataInfo};
use crate::merge_helper::ConsolidationMode;
use crate::metadata::MetadataTable;
use crate::retire::VersionRetirer;
use crate::store_assert;

/// Head of one delta during the walk.
struct DeltaHead {
    key: Vec<u8>,
    versions: DifferentialVersions,
    index: u32,
    source: usize,
    comparer: SharedComparer,
}

impl PartialEq for DeltaHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DeltaHead {}

impl PartialOrd for DeltaHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeltaHead {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: smallest key first, then the newest delta.
        self.comparer
            .compare(&other.key, &self.key)
            .then_with(|| self.index.cmp(&other.index))
    }
}

/// Key-ordered walk over a set of deltas.
struct DeltaWalk {
    sources: Vec<(u32, std::vec::IntoIter<(Vec<u8>, DifferentialVersions)>)>,
    heap: BinaryHeap<DeltaHead>,
    comparer: SharedComparer,
}

impl DeltaWalk {
    fn new<'a>(
        deltas: impl Iterator<Item = (u32, &'a Arc<DifferentialComponent>)>,
        comparer: SharedComparer,
    ) -> Self {
        let sources: Vec<_> = deltas.map(|(index, delta)| (index, delta.iter())).collect();
        let mut walk = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            comparer,
        };
        for source in 0..walk.sources.len() {
            walk.advance(source);
        }
        walk
    }

    fn advance(&mut self, source: usize) {
        let (index, iter) = &mut self.sources[source];
        if let Some((key, versions)) = iter.next() {
            self.heap.push(DeltaHead {
                key,
                versions,
                index: *index,
                source,
                comparer: self.comparer.clone(),
            });
        }
    }

    fn peek_key(&self) -> Option<&[u8]> {
        self.heap.peek().map(|head| head.key.as_slice())
    }

    /// Pops every delta's entry for the smallest key, newest delta first.
    fn pop_run(&mut self) -> Option<(Vec<u8>, Vec<DifferentialVersions>)> {
        let top = self.heap.pop()?;
        self.advance(top.source);
        let mut run = vec![top.versions];
        while let Some(peek) = self.heap.peek() {
            if self.comparer.compare(&peek.key, &top.key) != Ordering::Equal {
                break;
            }
            if let Some(dup) = self.heap.pop() {
                self.advance(dup.source);
                run.push(dup.versions);
            }
        }
        Some((top.key, run))
    }
}

/// Every version a run holds, oldest first.
fn version_chain(run: &[DifferentialVersions]) -> Vec<Arc<VersionedRecord>> {
    let mut chain = Vec::with_capacity(run.len() * 2);
    for versions in run.iter().rev() {
        if let Some(previous) = &versions.previous {
            chain.push(Arc::clone(previous));
        }
        chain.push(Arc::clone(&versions.current));
    }
    chain
}

struct PendingState {
    state: AggregatedState,
    highest_index: u32,
}

pub struct ConsolidationManager {
    ctx: Arc<StoreContext>,
    retirer: VersionRetirer,
    aggregated: ArcSwap<AggregatedState>,
    pending: Mutex<Option<PendingState>>,
    index_lock: Mutex<()>,
    installs: AtomicU64,
}

impl ConsolidationManager {
    pub(crate) fn new(ctx: Arc<StoreContext>, retirer: VersionRetirer) -> Self {
        let empty = AggregatedState::empty(ctx.comparer.clone());
        Self {
            ctx,
            retirer,
            aggregated: ArcSwap::from_pointee(empty),
            pending: Mutex::new(None),
            index_lock: Mutex::new(()),
            installs: AtomicU64::new(0),
        }
    }

    /// The currently published state.
    pub fn aggregated(&self) -> Arc<AggregatedState> {
        self.aggregated.load_full()
    }

    pub fn retirer(&self) -> &VersionRetirer {
        &self.retirer
    }

    /// How many consolidated states have been installed so far.
    pub fn installed_states(&self) -> u64 {
        self.installs.load(AtomicOrdering::Acquire)
    }

    pub fn has_pending_state(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Chains a frozen differential component onto the published state.
    pub fn append_delta(&self, delta: Arc<DifferentialComponent>) {
        store_assert!(delta.is_frozen(), "appending a delta that was never sorted");
        let _guard = self.index_lock.lock();
        let mut next = AggregatedState::clone(&self.aggregated.load());
        next.append_delta(delta);
        let index = next.index();
        self.aggregated.store(Arc::new(next));

        if index > self.ctx.config.slow_consolidation_index() {
            tracing::warn!(
                trace_type = self.ctx.trace_type(),
                index,
                threshold = self.ctx.config.number_of_deltas_to_be_consolidated,
                "consolidation is falling behind"
            );
        } else {
            tracing::debug!(trace_type = self.ctx.trace_type(), index, "appended delta");
        }
    }

    /// Builds the next consolidated component and, when the merge policy
    /// asks for it, merges checkpoint files listed in `table`.
    ///
    /// Returns `Ok(None)` when fewer deltas than the batch size have
    /// accumulated or no merge ran. The new state is installed right away
    /// with background consolidation enabled; otherwise the caller installs
    /// it with [`reset_to_new_aggregated_state`](Self::reset_to_new_aggregated_state).
    pub fn consolidate(
        &self,
        table: &MetadataTable,
        mode: ConsolidationMode,
        cancel: &CancellationToken,
    ) -> Result<Option<PostMergeMetadataInfo>> {
        let _prime = self
            .ctx
            .acquire_prime_shared("consolidation", self.ctx.config.consolidation_lock_timeout)?;
        self.consolidate_locked(table, mode, cancel)
    }

    /// [`consolidate`](Self::consolidate) for a caller already holding the
    /// prime lock.
    pub(crate) fn consolidate_locked(
        &self,
        table: &MetadataTable,
        mode: ConsolidationMode,
        cancel: &CancellationToken,
    ) -> Result<Option<PostMergeMetadataInfo>> {
        cancel.check()?;

        let state = self.aggregated.load_full();
        let highest_index = state.index();
        if highest_index > 0 {
            self.move_previous_versions_to_snapshot_container(&state, highest_index);
        }
        if highest_index < self.ctx.config.number_of_deltas_to_be_consolidated {
            tracing::debug!(
                trace_type = self.ctx.trace_type(),
                index = highest_index,
                "not enough deltas to consolidate"
            );
            return Ok(None);
        }

        let consolidated = ConsolidatedComponent::new(self.ctx.comparer.clone());
        self.differential_data(&state, highest_index, &consolidated, cancel)?;

        let merge_info = match self.ctx.merge_helper.should_merge(table, mode) {
            Some(file_ids) => Some(merge_files(&self.ctx, table, &file_ids, &consolidated, cancel)?),
            None => None,
        };

        tracing::info!(
            trace_type = self.ctx.trace_type(),
            index = highest_index,
            keys = consolidated.len(),
            merged = merge_info.is_some(),
            "consolidated"
        );

        *self.pending.lock() = Some(PendingState {
            state: AggregatedState::new(Arc::new(consolidated)),
            highest_index,
        });
        if self.ctx.config.enable_background_consolidation {
            self.reset_to_new_aggregated_state();
        }
        Ok(merge_info)
    }

    /// Installs the pending state, replaying the deltas appended while it
    /// was being built. Returns `false` when nothing was pending.
    pub fn reset_to_new_aggregated_state(&self) -> bool {
        let _guard = self.index_lock.lock();
        let Some(PendingState {
            mut state,
            highest_index,
        }) = self.pending.lock().take()
        else {
            return false;
        };

        let current = self.aggregated.load();
        for index in highest_index + 1..=current.index() {
            let delta = current.delta(index);
            store_assert!(
                delta.is_some(),
                "delta {} missing while replaying onto the consolidated state",
                index
            );
            if let Some(delta) = delta {
                state.append_delta(Arc::clone(delta));
            }
        }
        let replayed = state.index();
        self.aggregated.store(Arc::new(state));
        self.installs.fetch_add(1, AtomicOrdering::AcqRel);

        tracing::info!(
            trace_type = self.ctx.trace_type(),
            consolidated_through = highest_index,
            replayed,
            "installed consolidated state"
        );
        true
    }

    /// Evicts the in-memory values of records backed by a checkpoint file.
    /// Returns the number of values evicted.
    pub fn sweep(&self, cancel: &CancellationToken) -> Result<usize> {
        if !self.ctx.config.sweep_values {
            return Ok(0);
        }
        let state = self.aggregated.load_full();
        let mut swept = 0;
        for record in state.values_for_sweep() {
            cancel.check()?;
            if record.is_deleted() || !record.can_be_swept_to_disk() {
                continue;
            }
            if self.sweep_item(&record) {
                swept += 1;
            }
        }
        tracing::debug!(trace_type = self.ctx.trace_type(), swept, "sweep finished");
        Ok(swept)
    }

    /// Evicts one record's value unless a reader marked it since the last
    /// sweep. The mark is cleared so the next sweep may evict it.
    pub fn sweep_item(&self, record: &VersionedRecord) -> bool {
        if !record.is_in_memory() {
            return false;
        }
        if record.clear_in_use() {
            return false;
        }
        store_assert!(
            record.can_be_swept_to_disk(),
            "sweeping seq {} which has no checkpoint file",
            record.seq()
        );
        record.sweep()
    }

    /// Drops all state: back to an empty consolidated component.
    pub fn reset(&self) {
        let _guard = self.index_lock.lock();
        self.pending.lock().take();
        self.aggregated
            .store(Arc::new(AggregatedState::empty(self.ctx.comparer.clone())));
    }

    /// Loads a recovered record straight into the consolidated component.
    pub fn add(&self, key: &[u8], record: Arc<VersionedRecord>) {
        self.aggregated.load().consolidated().add(key, record);
    }

    pub fn read(&self, key: &[u8]) -> Option<Arc<VersionedRecord>> {
        self.aggregated.load().read(key)
    }

    pub fn read_at(&self, key: &[u8], lsn: u64) -> Option<Arc<VersionedRecord>> {
        self.aggregated.load().read_at(key, lsn)
    }

    pub fn read_next(&self, key: &[u8]) -> Option<(Vec<u8>, Arc<VersionedRecord>)> {
        self.aggregated.load().read_next(key)
    }

    pub fn enumerate_keys(&self) -> Vec<Vec<u8>> {
        self.aggregated.load().enumerate_keys()
    }

    pub fn count(&self) -> usize {
        self.aggregated.load().count()
    }

    /// Whether `key` has a live version in the checkpointed state.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.read(key).map_or(false, |record| !record.is_deleted())
    }

    fn move_previous_versions_to_snapshot_container(&self, state: &AggregatedState, highest_index: u32) {
        let delta = state.delta(highest_index);
        store_assert!(delta.is_some(), "highest delta {} is missing", highest_index);
        let Some(delta) = delta else {
            return;
        };
        let mut moved = 0usize;
        for (key, versions) in delta.iter() {
            let Some(previous) = versions.previous else {
                continue;
            };
            let seq = previous.seq();
            // The previous version stays readable in the delta until the
            // snapshot container holds it.
            self.process_to_be_removed_versions(&key, &[previous, versions.current]);
            delta.clear_previous(&key, seq);
            moved += 1;
        }
        if moved > 0 {
            tracing::debug!(
                trace_type = self.ctx.trace_type(),
                index = highest_index,
                moved,
                "retired previous versions of the highest delta"
            );
        }
    }

    fn process_to_be_removed_versions(&self, key: &[u8], versions: &[Arc<VersionedRecord>]) {
        if versions.len() > 1 {
            self.retirer.retire(key, versions);
        }
    }

    /// Counts a superseded on-disk entry against its file. Tombstones from
    /// older deltas are skipped; a base tombstone still takes up an entry
    /// in its file and counts.
    fn invalidate(&self, key: &[u8], record: &VersionedRecord, count_tombstone: bool) {
        let file_id = record.file_id();
        if file_id == 0 || (record.is_deleted() && !count_tombstone) {
            return;
        }
        let file = self.ctx.arena.get(file_id);
        store_assert!(
            file.is_some(),
            "superseded seq {} lives in unknown file {}",
            record.seq(),
            file_id
        );
        if let Some(file) = file {
            file.add_invalid_key(key);
        }
    }

    /// Merges deltas `1..=highest_index` of `state` with its consolidated
    /// component into `into`.
    fn differential_data(
        &self,
        state: &AggregatedState,
        highest_index: u32,
        into: &ConsolidatedComponent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let comparer = self.ctx.comparer.clone();
        let mut deltas = DeltaWalk::new(state.deltas_up_to(highest_index), comparer.clone());
        let mut base = state.consolidated().iter().peekable();

        loop {
            cancel.check()?;
            let order = match (deltas.peek_key(), base.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(delta_key), Some((base_key, _))) => comparer.compare(delta_key, base_key),
            };

            match order {
                Ordering::Greater => {
                    if let Some((key, record)) = base.next() {
                        if !record.is_deleted() {
                            into.add(&key, record);
                        }
                    }
                }
                Ordering::Less => {
                    if let Some((key, run)) = deltas.pop_run() {
                        self.fold_run(&key, &run, None, into);
                    }
                }
                Ordering::Equal => {
                    let base_entry = base.next();
                    if let (Some((key, run)), Some((_, old))) = (deltas.pop_run(), base_entry) {
                        self.fold_run(&key, &run, Some(old), into);
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves one key's delta run, optionally superseding a base record.
    fn fold_run(
        &self,
        key: &[u8],
        run: &[DifferentialVersions],
        old: Option<Arc<VersionedRecord>>,
        into: &ConsolidatedComponent,
    ) {
        for stale in &run[1..] {
            self.invalidate(key, &stale.current, false);
        }

        let mut chain = version_chain(run);
        if let Some(old) = old {
            self.invalidate(key, &old, true);
            chain.insert(0, old);
        }
        self.process_to_be_removed_versions(key, &chain);

        if let Some(winner) = chain.last() {
            if !winner.is_deleted() {
                into.add(key, Arc::clone(winner));
            }
        }
    }
}

impl std::fmt::Debug for ConsolidationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidationManager")
            .field("aggregated", &self.aggregated.load())
            .field("pending", &self.has_pending_state())
            .field("installs", &self.installed_states())
            .finish()
    }
}
