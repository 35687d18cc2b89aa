mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::{Fixture, ints};
use flintdelta::{ColumnDef, MemoryLogger, RowId, RowSet, StorageKind, StoreConfig, StoreContext, Table, Value};
use serial_test::serial;

#[test]
fn test_concurrent_delete_of_same_row() {
    let fx = Fixture::new();
    fx.load(ints(0..10));

    let mut a = fx.ctx.begin();
    let mut b = fx.ctx.begin();
    fx.table.delete(&fx.ctx, &mut a, &RowSet::Ids(vec![5])).unwrap();
    let err = fx
        .table
        .delete(&fx.ctx, &mut b, &RowSet::Ids(vec![5]))
        .unwrap_err();
    assert!(err.is_conflict(), "expected conflict, got {err}");

    fx.ctx.commit(a).unwrap();
    fx.ctx.rollback(b).unwrap();

    let tr = fx.ctx.begin();
    assert_eq!(fx.scan(&tr).len(), 9);
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_delete_after_concurrent_commit_conflicts() {
    let fx = Fixture::new();
    fx.load(ints(0..10));

    let mut late = fx.ctx.begin();
    let mut early = fx.ctx.begin();
    fx.table.delete(&fx.ctx, &mut early, &RowSet::range(2, 3)).unwrap();
    fx.ctx.commit(early).unwrap();

    let err = fx
        .table
        .delete(&fx.ctx, &mut late, &RowSet::range(0, 5))
        .unwrap_err();
    assert!(err.is_conflict());
    fx.ctx.rollback(late).unwrap();
}

#[test]
fn test_delete_of_pending_update_conflicts() {
    let fx = Fixture::new();
    fx.load(ints(0..10));

    let mut writer = fx.ctx.begin();
    let mut deleter = fx.ctx.begin();
    fx.table
        .update(&fx.ctx, &mut writer, "c", &RowSet::Ids(vec![3]), &[Value::Int(30)])
        .unwrap();
    let err = fx
        .table
        .delete(&fx.ctx, &mut deleter, &RowSet::range(0, 10))
        .unwrap_err();
    assert!(err.is_conflict());
    fx.ctx.rollback(deleter).unwrap();
    fx.ctx.commit(writer).unwrap();
}

#[test]
fn test_delete_elsewhere_ignores_pending_update() {
    let fx = Fixture::new();
    fx.load(ints(0..100));

    let mut writer = fx.ctx.begin();
    let mut deleter = fx.ctx.begin();
    fx.table
        .update(&fx.ctx, &mut writer, "c", &RowSet::Ids(vec![1]), &[Value::Int(10)])
        .unwrap();
    assert_eq!(fx.table.delete(&fx.ctx, &mut deleter, &RowSet::Ids(vec![50])).unwrap(), 1);
    assert_eq!(fx.table.delete(&fx.ctx, &mut deleter, &RowSet::range(60, 20)).unwrap(), 20);

    let err = fx
        .table
        .delete(&fx.ctx, &mut deleter, &RowSet::Ids(vec![1]))
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().contains("pending update"), "unexpected message {err}");

    fx.ctx.commit(writer).unwrap();
    fx.ctx.commit(deleter).unwrap();

    let tr = fx.ctx.begin();
    assert_eq!(fx.table.count_active(&fx.ctx, &tr), 79);
    assert_eq!(fx.value_at(&tr, 1), Some(Value::Int(10)));
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_update_of_concurrently_deleted_row_conflicts() {
    let fx = Fixture::new();
    fx.load(ints(0..10));

    let mut updater = fx.ctx.begin();
    let mut deleter = fx.ctx.begin();
    fx.table.delete(&fx.ctx, &mut deleter, &RowSet::Ids(vec![4])).unwrap();
    fx.ctx.commit(deleter).unwrap();

    let err = fx
        .table
        .update(&fx.ctx, &mut updater, "c", &RowSet::Ids(vec![4]), &[Value::Int(0)])
        .unwrap_err();
    assert!(err.is_conflict());
    fx.ctx.rollback(updater).unwrap();
}

#[test]
fn test_first_column_writer_wins() {
    let fx = Fixture::new();
    fx.load(ints(0..10));

    let mut a = fx.ctx.begin();
    let mut b = fx.ctx.begin();
    fx.table
        .update(&fx.ctx, &mut a, "c", &RowSet::Ids(vec![1]), &[Value::Int(100)])
        .unwrap();
    let err = fx
        .table
        .update(&fx.ctx, &mut b, "c", &RowSet::Ids(vec![2]), &[Value::Int(200)])
        .unwrap_err();
    assert!(err.is_conflict());
    fx.ctx.commit(a).unwrap();
    fx.ctx.rollback(b).unwrap();

    let tr = fx.ctx.begin();
    assert_eq!(fx.value_at(&tr, 1), Some(Value::Int(100)));
    assert_eq!(fx.value_at(&tr, 2), Some(Value::Int(2)));
    fx.ctx.commit(tr).unwrap();
}

#[test]
fn test_concurrent_appends_are_compatible() {
    let fx = Fixture::new();
    let mut a = fx.ctx.begin();
    let mut b = fx.ctx.begin();
    fx.insert(&mut a, ints(0..5));
    fx.insert(&mut b, ints(100..103));
    fx.ctx.commit(b).unwrap();
    fx.ctx.commit(a).unwrap();

    let tr = fx.ctx.begin();
    let mut values: Vec<Value> = fx.scan(&tr).into_iter().map(|(_, v)| v).collect();
    values.sort();
    let mut expected = ints(0..5);
    expected.extend(ints(100..103));
    assert_eq!(values, expected);
    fx.ctx.commit(tr).unwrap();
    fx.table.check_partition().unwrap();
}

#[test]
#[serial]
fn test_racing_deletes_have_one_winner() {
    let logger = Arc::new(MemoryLogger::new());
    let ctx = Arc::new(StoreContext::new(StoreConfig::default(), logger).unwrap());
    let table = Table::create(&ctx, "race", &[ColumnDef::new("c")]).unwrap();
    {
        let mut tr = ctx.begin();
        let claim = table.claim(&ctx, &mut tr, 16).unwrap();
        table.append(&ctx, &mut tr, "c", &claim, &ints(0..16)).unwrap();
        ctx.commit(tr).unwrap();
    }

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let (ctx, table, barrier) = (ctx.clone(), table.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                let mut tr = ctx.begin();
                match table.delete(&ctx, &mut tr, &RowSet::Ids(vec![7])) {
                    Ok(_) => ctx.commit(tr).map(|_| true),
                    Err(e) if e.is_conflict() => ctx.rollback(tr).map(|_| false),
                    Err(e) => Err(e),
                }
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().expect("thread panicked").expect("hard error"))
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    let tr = ctx.begin();
    assert_eq!(table.count_active(&ctx, &tr), 15);
    ctx.commit(tr).unwrap();
    table.check_partition().unwrap();
}

#[test]
#[serial]
fn test_appends_racing_dictionary_growth_keep_their_rows() {
    let config = StoreConfig {
        dictionary_small_limit: 4,
        dictionary_large_limit: 8,
        ..StoreConfig::default()
    };
    let ctx = Arc::new(StoreContext::new(config, Arc::new(MemoryLogger::new())).unwrap());
    let table = Table::create(&ctx, "dict", &[ColumnDef::with_kind("c", StorageKind::Dictionary)]).unwrap();

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads as i64)
        .map(|worker| {
            let (ctx, table, barrier) = (ctx.clone(), table.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                let mut committed = Vec::new();
                for round in 0..20 {
                    let values: Vec<Value> = (0..3).map(|i| Value::Int(worker * 1000 + round * 3 + i)).collect();
                    let mut tr = ctx.begin();
                    let claim = match table.claim(&ctx, &mut tr, 3) {
                        Ok(claim) => claim,
                        Err(e) => {
                            assert!(e.is_conflict(), "hard error {e}");
                            ctx.rollback(tr).unwrap();
                            continue;
                        }
                    };
                    match table.append(&ctx, &mut tr, "c", &claim, &values) {
                        Ok(()) => {
                            ctx.commit(tr).unwrap();
                            committed.extend(claim.to_vec().into_iter().zip(values));
                        }
                        Err(e) => {
                            assert!(e.is_conflict(), "hard error {e}");
                            ctx.rollback(tr).unwrap();
                        }
                    }
                }
                committed
            })
        })
        .collect();

    let mut expected: Vec<(RowId, Value)> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("thread panicked"))
        .collect();
    expected.sort();
    assert!(!expected.is_empty());

    let tr = ctx.begin();
    assert_eq!(table.scan(&ctx, &tr, "c").unwrap(), expected);
    ctx.commit(tr).unwrap();
    table.check_partition().unwrap();
}
