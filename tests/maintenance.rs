mod common;

use common::{Fixture, ints};
use flintdelta::storage::ColumnView;
use flintdelta::{AccessMode, Error, RowSet, StorageKind, StoreConfig, Value};

#[test]
fn test_clear_replaces_storage_for_untouched_table() {
    let fx = Fixture::new();
    fx.load(ints(0..10));

    let reader = fx.ctx.begin();
    let mut tr = fx.ctx.begin();
    assert_eq!(fx.table.clear(&fx.ctx, &mut tr).unwrap(), 10);
    assert!(fx.scan(&tr).is_empty());
    assert_eq!(fx.scan(&reader).len(), 10);
    assert_eq!(fx.table.storage_versions(), 2);
    fx.ctx.commit(tr).unwrap();

    assert_eq!(fx.scan(&reader).len(), 10);
    fx.ctx.commit(reader).unwrap();
    assert_eq!(fx.table.storage_versions(), 1);

    fx.load(ints(100..103));
    let tr = fx.ctx.begin();
    assert_eq!(
        fx.scan(&tr),
        vec![(0, Value::Int(100)), (1, Value::Int(101)), (2, Value::Int(102))]
    );
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_clear_after_own_changes_deletes_rows() {
    let fx = Fixture::new();
    fx.load(ints(0..10));

    let mut tr = fx.ctx.begin();
    fx.table.delete(&fx.ctx, &mut tr, &RowSet::Ids(vec![1])).unwrap();
    assert_eq!(fx.table.clear(&fx.ctx, &mut tr).unwrap(), 9);
    assert_eq!(fx.table.storage_versions(), 1);
    fx.ctx.commit(tr).unwrap();

    let tr = fx.ctx.begin();
    assert!(fx.scan(&tr).is_empty());
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_clear_conflicts_with_rows_it_cannot_see() {
    let fx = Fixture::new();
    let mut clearer = fx.ctx.begin();
    let mut writer = fx.ctx.begin();
    fx.insert(&mut writer, ints(0..3));

    let err = fx.table.clear(&fx.ctx, &mut clearer).unwrap_err();
    assert!(err.is_conflict());
    fx.ctx.rollback(clearer).unwrap();
    fx.ctx.commit(writer).unwrap();
}

#[test]
fn test_vacuum_rewrites_churned_columns() {
    let config = StoreConfig {
        vacuum_threshold: 3,
        ..StoreConfig::default()
    };
    let fx = Fixture::with_config(config);
    fx.load(ints(0..6));

    for rid in 0..4u64 {
        let mut tr = fx.ctx.begin();
        fx.table
            .update(&fx.ctx, &mut tr, "c", &RowSet::Ids(vec![rid]), &[Value::Int(rid as i64 * 10)])
            .unwrap();
        fx.ctx.commit(tr).unwrap();
    }
    assert_eq!(fx.table.column("c").unwrap().head().state().nr_updates, 4);

    let mut tr = fx.ctx.begin();
    fx.table.vacuum(&fx.ctx, &mut tr, false).unwrap();
    assert_eq!(tr.change_count(), 1);
    fx.ctx.commit(tr).unwrap();

    let column = fx.table.column("c").unwrap();
    assert_eq!(column.head().state().nr_updates, 0);
    let tr = fx.ctx.begin();
    let expected: Vec<Value> = [0, 10, 20, 30, 4, 5].into_iter().map(Value::Int).collect();
    assert_eq!(fx.table.read(&tr, "c").unwrap(), expected);
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_vacuum_below_threshold_is_a_no_op() {
    let fx = Fixture::new();
    fx.load(ints(0..6));
    let mut tr = fx.ctx.begin();
    fx.table.vacuum(&fx.ctx, &mut tr, false).unwrap();
    assert_eq!(tr.change_count(), 0);
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_compress_to_dictionary() {
    let fx = Fixture::new();
    let words = ["red", "green", "red", "blue", "green", "red"];
    fx.load(words.iter().map(|w| Value::from(*w)).collect());

    let mut tr = fx.ctx.begin();
    fx.table
        .compress(&fx.ctx, &mut tr, "c", StorageKind::Dictionary)
        .unwrap();
    fx.ctx.commit(tr).unwrap();

    let tr = fx.ctx.begin();
    match fx.table.bind(&tr, "c", AccessMode::ReadExtra).unwrap() {
        ColumnView::Dictionary(values) => assert_eq!(values.len(), 3),
        other => panic!("unexpected view {:?}", other),
    }
    let read: Vec<Value> = fx.table.read(&tr, "c").unwrap();
    assert_eq!(read, words.iter().map(|w| Value::from(*w)).collect::<Vec<_>>());
    assert_eq!(
        fx.table.min_max(&tr, "c").unwrap(),
        Some((Value::from("blue"), Value::from("red")))
    );
    assert_eq!(fx.table.is_sorted(&tr, "c").unwrap(), None);
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_compress_rejects_unencodable_values() {
    let fx = Fixture::new();
    fx.load(vec![Value::from("x"), Value::Int(1)]);
    let mut tr = fx.ctx.begin();
    let err = fx
        .table
        .compress(&fx.ctx, &mut tr, "c", StorageKind::FrameOfReference)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));
    fx.ctx.rollback(tr).unwrap();
}

#[test]
fn test_compress_conflicts_with_concurrent_writer() {
    let fx = Fixture::new();
    fx.load(ints(0..4));
    let mut writer = fx.ctx.begin();
    let mut compressor = fx.ctx.begin();
    fx.table
        .update(&fx.ctx, &mut writer, "c", &RowSet::Ids(vec![0]), &[Value::Int(7)])
        .unwrap();
    let err = fx
        .table
        .compress(&fx.ctx, &mut compressor, "c", StorageKind::FrameOfReference)
        .unwrap_err();
    assert!(err.is_conflict());
    fx.ctx.rollback(compressor).unwrap();
    fx.ctx.commit(writer).unwrap();
}
