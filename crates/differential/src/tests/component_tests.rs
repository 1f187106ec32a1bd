use crate::*;
use std::cmp::Ordering;
use std::sync::Arc;

fn rec(seq: u64, v: &str) -> Arc<VersionedRecord> {
    Arc::new(VersionedRecord::updated(seq, v.as_bytes().to_vec()))
}

#[derive(Debug)]
struct Reverse;

impl KeyComparer for Reverse {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

// -------------------- add / read --------------------

#[test]
fn add_keeps_two_versions_and_returns_third() {
    let c = DifferentialComponent::new(bytewise());
    assert!(c.add(b"k", rec(1, "a")).is_none());
    assert!(c.add(b"k", rec(2, "b")).is_none());

    let pair = c.add(b"k", rec(3, "c")).expect("oldest version evicted");
    assert_eq!(pair.retired.seq(), 1);
    assert_eq!(pair.next.seq(), 2);

    let versions = c.read_versions(b"k").unwrap();
    assert_eq!(versions.current.seq(), 3);
    assert_eq!(versions.previous.unwrap().seq(), 2);
    assert_eq!(c.len(), 1);
}

#[test]
#[should_panic]
fn add_rejects_stale_sequence_number() {
    let c = DifferentialComponent::new(bytewise());
    c.add(b"k", rec(5, "a"));
    c.add(b"k", rec(5, "b"));
}

#[test]
#[should_panic]
fn frozen_component_rejects_writes() {
    let c = DifferentialComponent::new(bytewise());
    c.sort();
    c.add(b"k", rec(1, "a"));
}

#[test]
fn read_at_picks_newest_visible_version() {
    let c = DifferentialComponent::new(bytewise());
    c.add(b"k", rec(10, "old"));
    c.add(b"k", rec(20, "new"));

    assert_eq!(c.read_at(b"k", 25).unwrap().seq(), 20);
    assert_eq!(c.read_at(b"k", 15).unwrap().seq(), 10);
    assert!(c.read_at(b"k", 5).is_none());
    assert!(c.read_at(b"missing", 100).is_none());
}

#[test]
fn clear_previous_only_drops_matching_version() {
    let c = DifferentialComponent::new(bytewise());
    c.add(b"k", rec(1, "a"));
    c.add(b"k", rec(2, "b"));

    assert!(!c.clear_previous(b"k", 2));
    assert_eq!(c.read_at(b"k", 1).unwrap().seq(), 1);

    assert!(c.clear_previous(b"k", 1));
    assert!(!c.clear_previous(b"k", 1));
    assert!(c.read_versions(b"k").unwrap().previous.is_none());
    assert_eq!(c.read(b"k").unwrap().seq(), 2);
    assert!(!c.clear_previous(b"missing", 1));
}

// -------------------- ordering --------------------

#[test]
fn iteration_follows_comparer() -> anyhow::Result<()> {
    let c = DifferentialComponent::new(Arc::new(Reverse));
    for (i, k) in ["b", "a", "c"].iter().enumerate() {
        c.add(k.as_bytes(), rec(i as u64 + 1, k));
    }
    assert_eq!(c.keys(), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);

    c.sort();
    assert!(c.is_frozen());
    assert_eq!(c.keys(), vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    let (next, _) = c.read_next(b"c").ok_or_else(|| anyhow::anyhow!("no next"))?;
    assert_eq!(next, b"b".to_vec());
    Ok(())
}

#[test]
fn read_next_on_unsorted_and_sorted_agree() {
    let c = DifferentialComponent::new(bytewise());
    for (i, k) in ["d", "b", "f"].iter().enumerate() {
        c.add(k.as_bytes(), rec(i as u64 + 1, k));
    }
    let before = c.read_next(b"c").map(|(k, _)| k);
    c.sort();
    let after = c.read_next(b"c").map(|(k, _)| k);
    assert_eq!(before, Some(b"d".to_vec()));
    assert_eq!(before, after);
    assert!(c.read_next(b"f").is_none());
}

#[test]
fn values_for_sweep_include_previous_versions() {
    let c = DifferentialComponent::new(bytewise());
    c.add(b"a", rec(1, "a1"));
    c.add(b"a", rec(2, "a2"));
    c.add(b"b", rec(3, "b1"));
    assert_eq!(c.values_for_sweep().len(), 3);
}

#[test]
fn many_keys_with_reuse() {
    let c = DifferentialComponent::new(bytewise());
    let mut retired = 0;
    for seq in 1..=3_000u64 {
        let key = format!("key{:03}", seq % 1_000);
        if c.add(key.as_bytes(), rec(seq, "x")).is_some() {
            retired += 1;
        }
    }
    assert_eq!(c.len(), 1_000);
    assert_eq!(retired, 1_000);
}
