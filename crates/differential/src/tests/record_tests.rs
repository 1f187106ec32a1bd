use crate::*;
use std::sync::Arc;

#[test]
fn constructors_set_kind_and_value() {
    let r = VersionedRecord::inserted(1, b"v".to_vec());
    assert_eq!(r.kind(), RecordKind::Inserted);
    assert_eq!(r.value().as_deref(), Some(&b"v"[..]));
    assert!(!r.is_deleted());

    let d = VersionedRecord::deleted(2);
    assert!(d.is_deleted());
    assert!(d.value().is_none());
    d.set_value(Arc::from(&b"ignored"[..]));
    assert!(d.value().is_none());
}

#[test]
fn kind_codes_roundtrip() {
    for kind in [RecordKind::Inserted, RecordKind::Updated, RecordKind::Deleted] {
        assert_eq!(RecordKind::from_u8(kind.as_u8()), Some(kind));
    }
    assert_eq!(RecordKind::from_u8(0), None);
}

#[test]
fn sweep_evicts_once() {
    let r = VersionedRecord::updated(3, b"value".to_vec());
    assert!(!r.can_be_swept_to_disk());
    r.set_location(ValueLocation::new(4, 16, 5));
    assert!(r.can_be_swept_to_disk());
    assert!(r.sweep());
    assert!(!r.sweep());
    assert_eq!(r.value_size(), 0);
    assert_eq!(r.location(), ValueLocation::new(4, 16, 5));
}

#[test]
fn in_use_flag_is_cleared_by_swap() {
    let r = VersionedRecord::inserted(1, b"x".to_vec());
    assert!(!r.clear_in_use());
    r.mark_in_use();
    assert!(r.is_in_use());
    assert!(r.clear_in_use());
    assert!(!r.is_in_use());
}

#[test]
fn tombstone_timestamp_is_stamped_once() {
    let d = VersionedRecord::deleted(9);
    d.set_timestamp_if_unset(5);
    d.set_timestamp_if_unset(8);
    assert_eq!(d.timestamp(), 5);
}

#[test]
fn with_location_leaves_source_record_untouched() {
    let r = VersionedRecord::inserted(7, b"abc".to_vec());
    r.set_location(ValueLocation::new(1, 0, 3));
    r.mark_in_use();

    let moved = r.with_location(ValueLocation::new(9, 100, 3));
    assert_eq!(moved.seq(), 7);
    assert_eq!(moved.file_id(), 9);
    assert_eq!(moved.value().as_deref(), Some(&b"abc"[..]));
    assert!(!moved.is_in_use());
    assert_eq!(r.file_id(), 1);
}

#[test]
fn checkpoint_records_start_swept() {
    let r = VersionedRecord::from_checkpoint(
        RecordKind::Deleted,
        12,
        ValueLocation::new(2, 0, 0),
        6,
    );
    assert!(!r.is_in_memory());
    assert_eq!(r.timestamp(), 6);
    assert_eq!(r.file_id(), 2);
}
