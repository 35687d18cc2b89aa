mod common;

use common::{Fixture, ints};
use flintdelta::{AccessMode, RowSet, Value};
use flintdelta::storage::ColumnView;

#[test]
fn test_snapshot_survives_concurrent_delete_and_update() {
    let fx = Fixture::new();
    fx.load(ints(0..100));

    let mut tx2 = fx.ctx.begin();
    let deleted = fx
        .table
        .delete(&fx.ctx, &mut tx2, &RowSet::range(50, 10))
        .expect("delete failed");
    assert_eq!(deleted, 10);
    fx.table
        .update(&fx.ctx, &mut tx2, "c", &RowSet::Ids(vec![70]), &[Value::Int(999)])
        .expect("update failed");

    let tx3 = fx.ctx.begin();
    let before = fx.scan(&tx3);
    assert_eq!(before.len(), 100);
    assert_eq!(before[70], (70, Value::Int(70)));
    assert!((50..60).all(|r| before.iter().any(|(rid, _)| *rid == r)));

    let own = fx.scan(&tx2);
    assert_eq!(own.len(), 90);
    assert!(own.contains(&(70, Value::Int(999))));

    fx.ctx.commit(tx2).expect("commit failed");

    // tx3 keeps its snapshot after tx2 committed
    let still = fx.scan(&tx3);
    assert_eq!(still, before);

    let tx4 = fx.ctx.begin();
    let after = fx.scan(&tx4);
    assert_eq!(after.len(), 90);
    assert!(after.contains(&(70, Value::Int(999))));
    assert!(after.iter().all(|(rid, _)| !(50..60).contains(rid)));

    fx.ctx.commit(tx3).unwrap();
    fx.ctx.commit(tx4).unwrap();

    // once every reader is gone the update is folded into the base
    let tx5 = fx.ctx.begin();
    assert_eq!(fx.scan(&tx5), after);
    match fx.table.bind(&tx5, "c", AccessMode::UpdateIds).unwrap() {
        ColumnView::UpdateIds(ids) => assert!(ids.is_empty()),
        other => panic!("unexpected view {:?}", other),
    }
    fx.ctx.commit(tx5).unwrap();
    fx.table.check_partition().unwrap();
}

#[test]
fn test_append_round_trip_through_read_only_bind() {
    let fx = Fixture::new();
    let values: Vec<Value> = (0..37).map(|i| Value::from(format!("v{i}").as_str())).collect();
    fx.load(values.clone());

    let tr = fx.ctx.begin();
    assert_eq!(
        fx.table.bind(&tr, "c", AccessMode::ReadOnly).unwrap(),
        ColumnView::Values(values)
    );
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_deleted_range_is_excluded_from_scan() {
    let fx = Fixture::new();
    fx.load(ints(0..20));

    let mut tr = fx.ctx.begin();
    fx.table.delete(&fx.ctx, &mut tr, &RowSet::range(5, 5)).unwrap();
    fx.ctx.commit(tr).unwrap();

    let tr = fx.ctx.begin();
    let rows: Vec<u64> = fx.scan(&tr).into_iter().map(|(rid, _)| rid).collect();
    let expected: Vec<u64> = (0..5).chain(10..20).collect();
    assert_eq!(rows, expected);
    fx.ctx.commit(tr).unwrap();
}
