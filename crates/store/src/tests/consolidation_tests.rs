use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use differential::{ValueLocation, VersionedRecord};
use tempfile::tempdir;

use super::helpers::*;
use crate::*;

fn memory_store(dir: &std::path::Path, deltas: u32) -> Result<(Store, Arc<RecordingVersionManager>)> {
    let mut config = test_config(dir);
    config.has_persisted_state = false;
    config.number_of_deltas_to_be_consolidated = deltas;
    let versions = RecordingVersionManager::new();
    let store = Store::open(config, versions.clone())?;
    Ok((store, versions))
}

fn consolidated_view(store: &Store) -> BTreeMap<Vec<u8>, u64> {
    store
        .consolidation_manager()
        .aggregated()
        .consolidated()
        .iter()
        .map(|(k, r)| (k, r.seq()))
        .collect()
}

// -------------------- End-to-end --------------------

#[test]
fn two_deltas_fold_into_base() -> Result<()> {
    let dir = tempdir()?;
    let (store, versions) = memory_store(dir.path(), 2)?;

    store.add(b"A", b"a1", 1)?;
    store.add(b"B", b"b1", 2)?;
    checkpoint(&store, 2)?;
    checkpoint(&store, 2)?;
    assert_eq!(store.consolidation_manager().installed_states(), 1);
    let before = versions.calls().len();

    store.update(b"B", b"b2", 3)?;
    store.add(b"C", b"c1", 4)?;
    checkpoint(&store, 4)?;
    store.remove(b"A", 5)?;
    store.update(b"C", b"c2", 6)?;
    checkpoint(&store, 6)?;

    let expected: BTreeMap<Vec<u8>, u64> = [(b"B".to_vec(), 3), (b"C".to_vec(), 6)].into();
    assert_eq!(consolidated_view(&store), expected);
    assert_eq!(store.consolidation_manager().aggregated().index(), 0);

    let calls = &versions.calls()[before..];
    assert!(calls.contains(&(1, 5)), "A:v1 retired against its tombstone");
    assert!(calls.contains(&(2, 3)), "B:v1 retired against B:v2");
    assert!(calls.contains(&(4, 6)));

    assert_eq!(value(&store, b"B").as_deref(), Some(&b"b2"[..]));
    assert_eq!(value(&store, b"A"), None);
    assert_eq!(store.count(), 2);
    Ok(())
}

// -------------------- Completeness --------------------

#[test]
fn newest_version_per_key_survives() -> Result<()> {
    let dir = tempdir()?;
    let (store, _) = memory_store(dir.path(), 4)?;

    // Delta d rewrites every key whose number is a multiple of d. The last
    // delta deletes the multiples of 20 instead.
    let mut seq = 0;
    let mut newest: BTreeMap<Vec<u8>, Option<u64>> = BTreeMap::new();
    for delta in 1..=4u64 {
        for i in 0..40u64 {
            if i % delta != 0 && delta != 1 {
                continue;
            }
            seq += 1;
            let key = format!("key{:03}", i).into_bytes();
            if delta == 4 && i % 5 == 0 {
                store.remove(&key, seq)?;
                newest.insert(key, None);
            } else {
                store.update(&key, format!("v{}", seq).as_bytes(), seq)?;
                newest.insert(key, Some(seq));
            }
        }
        checkpoint(&store, seq)?;
    }

    let expected: BTreeMap<Vec<u8>, u64> = newest
        .into_iter()
        .filter_map(|(k, s)| s.map(|s| (k, s)))
        .collect();
    assert_eq!(consolidated_view(&store), expected);
    assert_eq!(store.count(), expected.len() as i64);
    Ok(())
}

#[test]
fn retirement_pairs_are_strictly_increasing() -> Result<()> {
    let dir = tempdir()?;
    let (store, versions) = memory_store(dir.path(), 3)?;

    let mut seq = 0;
    for _ in 0..3 {
        for key in [&b"x"[..], b"y", b"z"] {
            for _ in 0..3 {
                seq += 1;
                store.update(key, b"v", seq)?;
            }
        }
        checkpoint(&store, seq)?;
    }

    let calls = versions.calls();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|&(deleted, next)| deleted < next));
    Ok(())
}

#[test]
fn duplicate_keys_leave_only_highest_sequence() -> Result<()> {
    let dir = tempdir()?;
    let (store, versions) = memory_store(dir.path(), 3)?;

    store.add(b"k", b"1", 1)?;
    checkpoint(&store, 1)?;
    store.update(b"k", b"2", 2)?;
    checkpoint(&store, 2)?;
    store.update(b"k", b"3", 3)?;
    checkpoint(&store, 3)?;

    let view = consolidated_view(&store);
    assert_eq!(view.get(&b"k"[..]), Some(&3));
    assert_eq!(view.len(), 1);
    assert_eq!(versions.calls(), vec![(1, 2), (2, 3)]);
    Ok(())
}

// -------------------- Below the batch size --------------------

#[test]
fn short_chain_is_left_alone() -> Result<()> {
    let dir = tempdir()?;
    let (store, _) = memory_store(dir.path(), 3)?;

    store.add(b"a", b"1", 1)?;
    store.prepare_checkpoint(1)?;
    let manager = store.consolidation_manager();
    let before = manager.aggregated();

    let table = store.current_metadata_table();
    let result = manager.consolidate(&table, ConsolidationMode::Default, &CancellationToken::new())?;
    assert!(result.is_none());
    assert!(Arc::ptr_eq(&before, &manager.aggregated()));
    assert!(!manager.has_pending_state());
    assert_eq!(manager.installed_states(), 0);
    Ok(())
}

#[test]
fn cancelled_consolidation_keeps_published_state() -> Result<()> {
    let dir = tempdir()?;
    let (store, _) = memory_store(dir.path(), 1)?;

    store.add(b"a", b"1", 1)?;
    store.prepare_checkpoint(1)?;
    let manager = store.consolidation_manager();
    let before = manager.aggregated();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let table = store.current_metadata_table();
    let err = manager
        .consolidate(&table, ConsolidationMode::Default, &cancel)
        .unwrap_err();
    assert!(err.is_retriable());
    assert!(Arc::ptr_eq(&before, &manager.aggregated()));

    // The prepared delta is still there for a retry.
    store.perform_checkpoint(&CancellationToken::new())?;
    store.complete_checkpoint()?;
    assert_eq!(manager.aggregated().consolidated().len(), 1);
    Ok(())
}

#[test]
fn writes_during_consolidation_are_replayed() -> Result<()> {
    let dir = tempdir()?;
    let (store, _) = memory_store(dir.path(), 1)?;
    let manager = store.consolidation_manager();

    store.add(b"a", b"1", 1)?;
    store.prepare_checkpoint(1)?;
    let table = store.current_metadata_table();
    manager.consolidate(&table, ConsolidationMode::Default, &CancellationToken::new())?;
    assert!(manager.has_pending_state());

    // A second delta lands before the pending state is installed.
    store.prepared.lock().take();
    store.add(b"b", b"2", 2)?;
    store.prepare_checkpoint(2)?;
    assert_eq!(manager.aggregated().index(), 2);

    assert!(manager.reset_to_new_aggregated_state());
    let state = manager.aggregated();
    assert_eq!(state.index(), 1);
    assert_eq!(state.consolidated().len(), 1);
    assert!(state.read(b"b").is_some());
    assert!(!manager.reset_to_new_aggregated_state());
    Ok(())
}

// -------------------- Snapshot preservation --------------------

#[test]
fn retired_version_stays_visible_to_reader() -> Result<()> {
    let dir = tempdir()?;
    let (store, versions) = memory_store(dir.path(), 1)?;

    store.add(b"k", b"old", 1)?;
    checkpoint(&store, 1)?;
    versions.add_reader(3);
    store.update(b"k", b"new", 5)?;
    checkpoint(&store, 5)?;

    assert_eq!(value(&store, b"k").as_deref(), Some(&b"new"[..]));
    assert_eq!(value_at(&store, b"k", 3).as_deref(), Some(&b"old"[..]));
    assert_eq!(store.snapshot_container().len(), 1);

    versions.finish_readers();
    assert!(eventually(|| store.snapshot_container().is_empty()));
    assert_eq!(value_at(&store, b"k", 3), None);
    Ok(())
}

#[test]
fn previous_version_of_highest_delta_is_retired() -> Result<()> {
    let dir = tempdir()?;
    let (store, versions) = memory_store(dir.path(), 1)?;
    versions.add_reader(1);

    store.add(b"k", b"first", 1)?;
    store.update(b"k", b"second", 2)?;
    checkpoint(&store, 2)?;

    assert_eq!(versions.calls(), vec![(1, 2)]);
    assert_eq!(value_at(&store, b"k", 1).as_deref(), Some(&b"first"[..]));
    assert_eq!(value(&store, b"k").as_deref(), Some(&b"second"[..]));
    Ok(())
}

#[test]
fn previous_version_readable_while_being_retired() -> Result<()> {
    let dir = tempdir()?;
    let (store, versions) = memory_store(dir.path(), 1)?;
    versions.add_reader(1);

    store.add(b"k", b"first", 1)?;
    store.update(b"k", b"second", 2)?;
    store.prepare_checkpoint(2)?;
    let delta = store.consolidation_manager().aggregated().delta(1).cloned().unwrap();

    // Reads below the differential, as get_at does, from inside the
    // retirement call.
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        let manager = Arc::clone(store.consolidation_manager());
        let snapshots = Arc::clone(store.snapshot_container());
        versions.set_on_query(Some(Box::new(move |deleted, next| {
            let record = snapshots
                .read_at(b"k", 1)
                .or_else(|| manager.read_at(b"k", 1));
            seen.lock().push((deleted, next, record.and_then(|r| r.value()).map(|v| v.to_vec())));
        })));
    }
    store.perform_checkpoint(&CancellationToken::new())?;
    store.complete_checkpoint()?;
    versions.set_on_query(None);

    assert_eq!(*seen.lock(), vec![(1, 2, Some(b"first".to_vec()))]);
    assert_eq!(value_at(&store, b"k", 1).as_deref(), Some(&b"first"[..]));
    assert!(delta.read_versions(b"k").unwrap().previous.is_none());
    Ok(())
}

#[test]
fn third_write_retires_through_differential() -> Result<()> {
    let dir = tempdir()?;
    let (store, versions) = memory_store(dir.path(), 1)?;
    versions.add_reader(1);

    store.add(b"k", b"a", 1)?;
    store.update(b"k", b"b", 2)?;
    store.update(b"k", b"c", 3)?;

    assert_eq!(versions.calls(), vec![(1, 2)]);
    assert_eq!(value_at(&store, b"k", 1).as_deref(), Some(&b"a"[..]));
    assert_eq!(value_at(&store, b"k", 2).as_deref(), Some(&b"b"[..]));
    Ok(())
}

// -------------------- Invalid entries --------------------

#[test]
fn superseded_file_entries_are_invalidated() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    store.add(b"a", b"1", 1)?;
    store.add(b"b", b"1", 2)?;
    checkpoint(&store, 2)?;
    store.update(b"a", b"2", 3)?;
    store.remove(b"b", 4)?;
    checkpoint(&store, 4)?;

    let table = store.current_metadata_table();
    let first = table.require(1);
    assert_eq!(first.invalid_entries(), 2);
    assert!(first.contains_invalid_key(b"a"));
    // Tombstones are never counted as invalid.
    assert_eq!(table.require(2).invalid_entries(), 0);
    Ok(())
}

#[test]
fn superseded_base_tombstone_is_invalidated() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    store.add(b"a", b"1", 1)?;
    store.add(b"gone", b"1", 2)?;
    store.remove(b"gone", 3)?;
    checkpoint(&store, 3)?;
    assert_eq!(store.current_metadata_table().require(1).deleted_entries(), 1);

    // A base tombstone that still points at its entry in file 1.
    let tombstone = VersionedRecord::deleted(3).with_location(ValueLocation::new(1, 0, 0));
    store.consolidation_manager().add(b"gone", Arc::new(tombstone));

    store.add(b"gone", b"2", 4)?;
    checkpoint(&store, 4)?;

    let table = store.current_metadata_table();
    let first = table.require(1);
    assert_eq!(first.invalid_entries(), 1);
    assert!(first.contains_invalid_key(b"gone"));
    assert_eq!(value(&store, b"gone").as_deref(), Some(&b"2"[..]));
    Ok(())
}

// -------------------- Sweep --------------------

#[test]
fn sweep_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    for i in 0..10u64 {
        store.add(format!("k{}", i).as_bytes(), b"value", i + 1)?;
    }
    checkpoint(&store, 10)?;

    let manager = store.consolidation_manager();
    let cancel = CancellationToken::new();
    assert_eq!(manager.sweep(&cancel)?, 10);
    assert_eq!(manager.sweep(&cancel)?, 0);
    assert!(!manager.read(b"k3").unwrap().is_in_memory());
    Ok(())
}

#[test]
fn read_value_survives_one_sweep() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    store.add(b"k", b"value", 1)?;
    checkpoint(&store, 1)?;

    let manager = store.consolidation_manager();
    let cancel = CancellationToken::new();
    assert_eq!(manager.sweep(&cancel)?, 1);

    assert_eq!(value(&store, b"k").as_deref(), Some(&b"value"[..]));
    assert_eq!(manager.sweep(&cancel)?, 0, "reader marked it in use");
    assert_eq!(manager.sweep(&cancel)?, 1);
    Ok(())
}

#[test]
fn sweep_disabled_keeps_values() -> Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(dir.path());
    config.sweep_values = false;
    let store = open_with(config)?;
    store.add(b"k", b"value", 1)?;
    checkpoint(&store, 1)?;

    assert_eq!(store.consolidation_manager().sweep(&CancellationToken::new())?, 0);
    assert!(store.consolidation_manager().read(b"k").unwrap().is_in_memory());
    Ok(())
}

#[test]
fn unwritten_records_are_not_swept() -> Result<()> {
    let dir = tempdir()?;
    let (store, _) = memory_store(dir.path(), 1)?;
    store.add(b"k", b"value", 1)?;
    checkpoint(&store, 1)?;

    assert_eq!(store.consolidation_manager().sweep(&CancellationToken::new())?, 0);
    assert_eq!(value(&store, b"k").as_deref(), Some(&b"value"[..]));
    Ok(())
}
