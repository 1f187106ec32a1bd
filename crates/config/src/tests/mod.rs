use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_match_constants() {
    let cfg = StoreConfig::default();
    assert_eq!(cfg.number_of_deltas_to_be_consolidated, 3);
    assert_eq!(cfg.slow_consolidation_index(), 10);
    assert!(cfg.enable_background_consolidation);
    assert_eq!(cfg.merge.policy, MergePolicy::INVALID_ENTRIES);
    assert_eq!(cfg.merge.merge_files_count_threshold, 16);
    assert_eq!(cfg.checkpoint_lock_timeout, Duration::from_millis(1000));
}

#[test]
fn env_overrides_are_applied() {
    let cfg = StoreConfig::from_lookup(lookup_from(&[
        ("TSTORE_WORKING_DIR", "/tmp/ts"),
        ("TSTORE_DELTAS_TO_CONSOLIDATE", "1"),
        ("TSTORE_BACKGROUND_CONSOLIDATION", "false"),
        ("TSTORE_MERGE_POLICY", "invalid, filecount"),
        ("TSTORE_INVALID_ENTRIES_COUNT", "1"),
    ]));
    assert_eq!(cfg.working_dir, PathBuf::from("/tmp/ts"));
    assert_eq!(cfg.number_of_deltas_to_be_consolidated, 1);
    assert!(!cfg.enable_background_consolidation);
    assert!(cfg.merge.policy.contains(MergePolicy::INVALID_ENTRIES));
    assert!(cfg.merge.policy.contains(MergePolicy::FILE_COUNT));
    assert!(!cfg.merge.policy.contains(MergePolicy::DELETED_ENTRIES));
    assert_eq!(cfg.merge.number_of_invalid_entries, Some(1));
}

#[test]
fn malformed_numbers_fall_back_to_defaults() {
    let cfg = StoreConfig::from_lookup(lookup_from(&[
        ("TSTORE_DELTAS_TO_CONSOLIDATE", "many"),
        ("TSTORE_CHECKPOINT_LOCK_TIMEOUT_MS", "-5"),
    ]));
    assert_eq!(cfg.number_of_deltas_to_be_consolidated, 3);
    assert_eq!(cfg.checkpoint_lock_timeout, Duration::from_millis(1000));
}

#[test]
fn merge_policy_parsing() {
    assert!(MergePolicy::parse_list("none").is_none());
    assert_eq!(MergePolicy::parse_list("all"), MergePolicy::ALL);
    assert_eq!(
        MergePolicy::parse_list("deleted,bogus"),
        MergePolicy::DELETED_ENTRIES
    );
    assert!(!MergePolicy::NONE.contains(MergePolicy::NONE));
}
