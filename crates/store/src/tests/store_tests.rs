use anyhow::Result;
use config::MergePolicy;
use tempfile::tempdir;

use super::helpers::*;
use crate::*;

// -------------------- Writes and reads --------------------

#[test]
fn add_update_remove_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    store.add(b"k", b"v1", 1)?;
    assert_eq!(value(&store, b"k").as_deref(), Some(&b"v1"[..]));
    store.update(b"k", b"v2", 2)?;
    assert_eq!(value(&store, b"k").as_deref(), Some(&b"v2"[..]));
    store.remove(b"k", 3)?;
    assert_eq!(value(&store, b"k"), None);
    assert!(!store.contains_key(b"k"));
    assert_eq!(store.count(), 0);
    Ok(())
}

#[test]
fn count_tracks_live_keys_only() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    store.add(b"a", b"1", 1)?;
    store.add(b"b", b"1", 2)?;
    store.update(b"a", b"2", 3)?;
    assert_eq!(store.count(), 2);

    store.remove(b"missing", 4)?;
    assert_eq!(store.count(), 2);

    checkpoint(&store, 4)?;
    store.remove(b"b", 5)?;
    store.remove(b"b", 6)?;
    assert_eq!(store.count(), 1);
    assert_eq!(store.stats().count, 1);
    Ok(())
}

#[test]
fn apply_dispatches_write_ops() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    let ops = vec![
        WriteOp::Add { key: b"x".to_vec(), value: b"1".to_vec(), seq: 1 },
        WriteOp::Update { key: b"x".to_vec(), value: b"2".to_vec(), seq: 2 },
        WriteOp::Add { key: b"y".to_vec(), value: b"1".to_vec(), seq: 3 },
        WriteOp::Remove { key: b"y".to_vec(), seq: 4 },
    ];
    assert_eq!(ops[3].key(), b"y");
    assert_eq!(ops[3].seq(), 4);
    for op in ops {
        store.apply(op)?;
    }
    assert_eq!(value(&store, b"x").as_deref(), Some(&b"2"[..]));
    assert_eq!(value(&store, b"y"), None);
    Ok(())
}

#[test]
fn get_at_reads_previous_differential_version() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    store.add(b"k", b"five", 5)?;
    store.update(b"k", b"nine", 9)?;
    assert_eq!(value_at(&store, b"k", 6).as_deref(), Some(&b"five"[..]));
    assert_eq!(value_at(&store, b"k", 9).as_deref(), Some(&b"nine"[..]));
    assert_eq!(value_at(&store, b"k", 4), None);
    Ok(())
}

#[test]
fn get_at_falls_back_to_checkpointed_state() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    store.add(b"k", b"old", 2)?;
    checkpoint(&store, 2)?;
    store.update(b"k", b"new", 7)?;

    assert_eq!(value_at(&store, b"k", 3).as_deref(), Some(&b"old"[..]));
    assert_eq!(value_at(&store, b"k", 1), None);
    Ok(())
}

#[test]
fn scans_merge_differential_and_checkpointed_keys() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    store.add(b"a", b"1", 1)?;
    store.add(b"c", b"3", 2)?;
    checkpoint(&store, 2)?;
    store.add(b"b", b"2", 3)?;
    store.add(b"d", b"4", 4)?;
    store.remove(b"c", 5)?;

    assert_eq!(store.keys(), vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec()]);
    let (next, v) = store.read_next(b"a")?.unwrap();
    assert_eq!((next.as_slice(), &*v), (&b"b"[..], &b"2"[..]));
    let (next, _) = store.read_next(b"b")?.unwrap();
    assert_eq!(next, b"d".to_vec(), "deleted c is skipped");
    assert!(store.read_next(b"d")?.is_none());
    Ok(())
}

// -------------------- Checkpoint protocol --------------------

#[test]
fn perform_and_complete_without_prepare_are_no_ops() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;

    store.perform_checkpoint(&CancellationToken::new())?;
    assert!(store.next_metadata_table().is_none());
    store.complete_checkpoint()?;
    assert!(key_files(dir.path()).is_empty());
    Ok(())
}

#[test]
#[should_panic]
fn double_prepare_is_fatal() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path()).unwrap();
    store.prepare_checkpoint(1).unwrap();
    store.prepare_checkpoint(2).unwrap();
}

#[test]
fn checkpoint_writes_file_and_metadata() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    store.add(b"a", b"1", 1)?;
    store.remove(b"z", 2)?;

    store.prepare_checkpoint(2)?;
    assert_eq!(store.stats().differential_keys, 0);
    assert_eq!(store.stats().deltas, 1);
    store.perform_checkpoint(&CancellationToken::new())?;
    let paths = MetadataPaths::in_dir(dir.path());
    assert!(paths.temp.exists());
    assert_eq!(store.current_metadata_table().len(), 0);

    store.complete_checkpoint()?;
    assert!(!paths.temp.exists());
    let persisted = MetadataManager::open(&paths.current)?;
    assert_eq!(persisted.checkpoint_lsn, 2);
    assert_eq!(persisted.files.len(), 1);
    assert_eq!(persisted.files[0].total_entries, 2);
    assert_eq!(persisted.files[0].deleted_entries, 1);
    assert_eq!(persisted.files[0].oldest_deleted_timestamp, 1);
    Ok(())
}

#[test]
fn empty_checkpoint_writes_no_file() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    checkpoint(&store, 1)?;

    assert!(key_files(dir.path()).is_empty());
    assert_eq!(store.current_metadata_table().checkpoint_lsn(), 1);
    Ok(())
}

#[test]
fn old_table_is_released_on_complete() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    store.add(b"a", b"1", 1)?;
    checkpoint(&store, 1)?;
    let first = store.current_metadata_table();

    store.add(b"b", b"1", 2)?;
    checkpoint(&store, 2)?;
    assert_eq!(first.reference_count(), 0);
    assert_eq!(store.file_arena().reference_count(1), 1);
    Ok(())
}

// -------------------- Background work --------------------

fn background_config(dir: &std::path::Path) -> config::StoreConfig {
    let mut config = test_config(dir);
    config.enable_background_consolidation = true;
    config
}

#[test]
fn background_consolidation_installs_state() -> Result<()> {
    let dir = tempdir()?;
    let store = open_with(background_config(dir.path()))?;

    store.add(b"a", b"1", 1)?;
    checkpoint(&store, 1)?;
    store.wait_for_consolidation();

    let manager = store.consolidation_manager();
    assert_eq!(manager.installed_states(), 1);
    assert_eq!(manager.aggregated().index(), 0);
    assert_eq!(manager.aggregated().consolidated().len(), 1);
    assert_eq!(value(&store, b"a").as_deref(), Some(&b"1"[..]));

    // The finished result is claimed by the next perform.
    store.add(b"b", b"1", 2)?;
    checkpoint(&store, 2)?;
    store.wait_for_consolidation();
    assert_eq!(manager.installed_states(), 2);
    Ok(())
}

#[test]
fn background_merge_is_folded_by_next_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let mut config = background_config(dir.path());
    config.merge.policy = MergePolicy::FILE_COUNT;
    config.merge.file_count_merge_threshold = 2;
    let store = open_with(config)?;

    store.add(b"a", b"1", 1)?;
    checkpoint(&store, 1)?;
    store.wait_for_consolidation();
    store.add(b"b", b"1", 2)?;
    checkpoint(&store, 2)?;
    store.wait_for_consolidation();

    // Files 1 and 2 are merged into 3, which only the merge table lists.
    let merge_table = store.merge_metadata_table().unwrap();
    assert_eq!(merge_table.file_ids(), vec![3]);
    assert_eq!(store.current_metadata_table().file_ids(), vec![1, 2]);
    store.consolidation_manager().sweep(&CancellationToken::new())?;
    assert_eq!(value(&store, b"a").as_deref(), Some(&b"1"[..]));

    store.add(b"c", b"1", 3)?;
    store.prepare_checkpoint(3)?;
    store.perform_checkpoint(&CancellationToken::new())?;
    assert_eq!(store.files_to_be_deleted(), vec![1, 2]);
    assert_eq!(store.next_metadata_table().unwrap().file_ids(), vec![3, 4]);
    store.complete_checkpoint()?;
    store.wait_for_consolidation();

    assert_eq!(store.current_metadata_table().file_ids(), vec![3, 4]);
    assert!(!dir.path().join("ckpt-0000000001.sdk").exists());
    assert!(!dir.path().join("ckpt-0000000002.sdk").exists());
    assert_eq!(value(&store, b"b").as_deref(), Some(&b"1"[..]));
    Ok(())
}

#[test]
fn sweep_runs_after_new_state_is_installed() -> Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(dir.path());
    config.enable_sweep = true;
    let store = open_with(config)?;

    store.add(b"k", b"value", 1)?;
    checkpoint(&store, 1)?;
    store.wait_for_sweep();

    let record = store.consolidation_manager().read(b"k").unwrap();
    assert!(!record.is_in_memory());
    assert_eq!(value(&store, b"k").as_deref(), Some(&b"value"[..]));
    assert!(record.is_in_memory());
    Ok(())
}

// -------------------- Clear / close --------------------

#[test]
fn clear_drops_state_and_files() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    store.add(b"a", b"1", 1)?;
    checkpoint(&store, 1)?;
    store.add(b"b", b"1", 2)?;

    store.clear()?;
    assert_eq!(store.count(), 0);
    assert_eq!(value(&store, b"a"), None);
    assert_eq!(value(&store, b"b"), None);
    assert!(key_files(dir.path()).is_empty());
    assert!(store.current_metadata_table().is_empty());
    assert!(store.file_arena().is_empty());
    let persisted = MetadataManager::open(&MetadataPaths::in_dir(dir.path()).current)?;
    assert_eq!(persisted, PersistedTable::default());

    store.add(b"c", b"1", 3)?;
    checkpoint(&store, 3)?;
    drop(store);

    let store = open_store(dir.path())?;
    store.recover_checkpoint()?;
    assert_eq!(store.keys(), vec![b"c".to_vec()]);
    Ok(())
}

#[test]
fn clear_discards_prepared_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    store.add(b"a", b"1", 1)?;
    store.prepare_checkpoint(1)?;

    store.clear()?;
    store.perform_checkpoint(&CancellationToken::new())?;
    assert!(store.next_metadata_table().is_none());
    assert_eq!(store.stats().deltas, 0);
    Ok(())
}

#[test]
fn closed_store_rejects_operations() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    store.add(b"a", b"1", 1)?;
    checkpoint(&store, 1)?;

    store.close()?;
    store.close()?;
    assert!(store.is_closed());
    assert!(matches!(store.get(b"a"), Err(StoreError::Closed)));
    assert!(matches!(store.add(b"b", b"1", 2), Err(StoreError::Closed)));
    assert!(matches!(store.prepare_checkpoint(2), Err(StoreError::Closed)));
    assert!(matches!(store.clear(), Err(StoreError::Closed)));
    assert_eq!(key_files(dir.path()).len(), 1, "close never deletes files");
    Ok(())
}

#[test]
fn close_keeps_merged_away_files_for_recovery() -> Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(dir.path());
    config.merge.policy = MergePolicy::FILE_COUNT;
    config.merge.file_count_merge_threshold = 2;
    let store = open_with(config)?;

    store.add(b"a", b"1", 1)?;
    checkpoint(&store, 1)?;
    store.add(b"b", b"1", 2)?;
    store.prepare_checkpoint(2)?;
    store.perform_checkpoint(&CancellationToken::new())?;
    assert_eq!(store.files_to_be_deleted(), vec![1, 2]);

    store.close()?;
    assert!(dir.path().join("ckpt-0000000001.sdk").exists());
    assert!(store.files_to_be_deleted().is_empty());
    drop(store);

    // The merge was never completed: recovery goes back to file 1.
    let store = open_store(dir.path())?;
    store.recover_checkpoint()?;
    assert_eq!(store.current_metadata_table().file_ids(), vec![1]);
    assert_eq!(key_files(dir.path()), vec!["ckpt-0000000001.sdk".to_string()]);
    assert_eq!(value(&store, b"a").as_deref(), Some(&b"1"[..]));
    Ok(())
}

#[test]
fn stats_reflect_components() -> Result<()> {
    let dir = tempdir()?;
    let store = open_store(dir.path())?;
    store.add(b"a", b"1", 1)?;
    checkpoint(&store, 1)?;
    store.add(b"b", b"1", 2)?;

    let stats = store.stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.differential_keys, 1);
    assert_eq!(stats.consolidated_keys, 1);
    assert_eq!(stats.files, 1);
    assert_eq!(stats.open_files, 1);
    assert_eq!(stats.pending_deletes, 0);
    assert_eq!(stats.snapshot_entries, 0);
    Ok(())
}
