use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::array::{StorageArray, StorageKind};
use super::chain::{VersionChain, Versioned};
use super::changes::TableChange;
use super::column::Column;
use super::delta::{Delta, materialize};
use super::segment::{Candidates, Claim, Segments};
use crate::error::{Error, Result};
use crate::store::StoreContext;
use crate::transaction::Transaction;
use crate::types::{ObjectId, RowId, RowSet, Timestamp, is_transaction_id};

/// Timestamp of storage created outside any transaction.
pub(crate) const CREATED_TS: Timestamp = 1;

/// Whether a table's changes reach the logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persistence {
    Persistent,
    /// Never logged.
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: StorageKind,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>) -> Self {
        ColumnDef {
            name: name.into(),
            kind: StorageKind::Plain,
        }
    }

    pub fn with_kind(name: impl Into<String>, kind: StorageKind) -> Self {
        ColumnDef {
            name: name.into(),
            kind,
        }
    }
}

/// What [`Table::count_deleted`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCount {
    /// Rows absent for the transaction.
    Deleted,
    /// Rows inserted by the transaction.
    Inserts,
    /// Segments in the chain.
    Segments,
    /// Rows recorded in the committed deletion bitmap.
    Bitmap,
}

/// Committed deletion bitmap, aligned with the segment chain.
#[derive(Debug, Clone, Default)]
pub struct DeletionMap {
    pub bitmap: RoaringTreemap,
    /// Rows the bitmap covers.
    pub count: u64,
}

/// One version of a table's row-visibility state.
#[derive(Debug)]
pub struct TableStorage {
    ts: AtomicU64,
    segments: RwLock<Segments>,
    deletes: RwLock<DeletionMap>,
    cleared: AtomicBool,
    next: RwLock<Option<Arc<TableStorage>>>,
}

impl Versioned for TableStorage {
    fn version_ts(&self) -> Timestamp {
        self.ts()
    }

    fn next_version(&self) -> Option<Arc<Self>> {
        self.next.read().clone()
    }

    fn set_next_version(&self, next: Option<Arc<Self>>) {
        *self.next.write() = next;
    }
}

impl TableStorage {
    pub fn new(ts: Timestamp) -> Self {
        TableStorage {
            ts: AtomicU64::new(ts),
            segments: RwLock::new(Segments::new()),
            deletes: RwLock::new(DeletionMap::default()),
            cleared: AtomicBool::new(false),
            next: RwLock::new(None),
        }
    }

    fn cleared_for(tid: Timestamp, next: Arc<TableStorage>) -> Self {
        let s = TableStorage::new(tid);
        s.cleared.store(true, Ordering::Release);
        *s.next.write() = Some(next);
        s
    }

    pub fn ts(&self) -> Timestamp {
        self.ts.load(Ordering::Acquire)
    }

    pub fn set_ts(&self, ts: Timestamp) {
        self.ts.store(ts, Ordering::Release);
    }

    pub fn segments(&self) -> RwLockReadGuard<'_, Segments> {
        self.segments.read()
    }

    pub fn segments_mut(&self) -> RwLockWriteGuard<'_, Segments> {
        self.segments.write()
    }

    pub fn deletes(&self) -> RwLockReadGuard<'_, DeletionMap> {
        self.deletes.read()
    }

    pub fn deletes_mut(&self) -> RwLockWriteGuard<'_, DeletionMap> {
        self.deletes.write()
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    pub fn set_cleared(&self, cleared: bool) {
        self.cleared.store(cleared, Ordering::Release);
    }

    pub fn next(&self) -> Option<Arc<TableStorage>> {
        self.next_version()
    }

    fn reset(&self) {
        *self.segments.write() = Segments::new();
        *self.deletes.write() = DeletionMap::default();
        self.set_cleared(true);
    }
}

/// A table: versioned row-visibility storage plus one versioned delta chain per column.
pub struct Table {
    id: ObjectId,
    name: String,
    persistence: Persistence,
    pub(crate) storage: VersionChain<TableStorage>,
    pub(crate) columns: Vec<Column>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("persistence", &self.persistence)
            .field("columns", &self.columns.len())
            .finish()
    }
}

impl Table {
    pub fn create(ctx: &StoreContext, name: impl Into<String>, columns: &[ColumnDef]) -> Result<Arc<Table>> {
        Table::create_with(ctx, name, Persistence::Persistent, columns)
    }

    pub fn create_with(
        ctx: &StoreContext,
        name: impl Into<String>,
        persistence: Persistence,
        columns: &[ColumnDef],
    ) -> Result<Arc<Table>> {
        let id = ctx.next_object_id();
        let mut cols = Vec::with_capacity(columns.len());
        for def in columns {
            if cols.iter().any(|c: &Column| c.name() == def.name) {
                return Err(Error::InvalidOperation(format!("duplicate column {}", def.name)));
            }
            let base = StorageArray::build(def.kind, Vec::new(), ctx.tiers())?;
            cols.push(Column::new(ctx.next_object_id(), def.name.clone(), Delta::new(base, CREATED_TS)));
        }
        let table = Table {
            id,
            name: name.into(),
            persistence,
            storage: VersionChain::new(TableStorage::new(CREATED_TS)),
            columns: cols,
        };
        debug!(table_id = id, name = %table.name, columns = columns.len(), "created table");
        Ok(Arc::new(table))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    pub fn is_logged(&self) -> bool {
        self.persistence == Persistence::Persistent
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub(crate) fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| Error::InvalidOperation(format!("no column {} in table {}", name, self.name)))
    }

    /// Storage version `tr` reads.
    pub fn storage_for(&self, tr: &Transaction) -> Arc<TableStorage> {
        self.storage.visible(tr)
    }

    pub fn storage_versions(&self) -> usize {
        self.storage.depth()
    }

    /// Head storage for row-slot mutation; another transaction's cleared storage is a conflict.
    pub(crate) fn bind_del_data(&self, tr: &Transaction) -> Result<Arc<TableStorage>> {
        let head = self.storage.head();
        let ts = head.ts();
        if ts != tr.tid && is_transaction_id(ts) && !tr.is_version_of_parent(ts) {
            debug!(table_id = self.id, tid = tr.tid, "table storage owned by another transaction");
            return Err(Error::conflict(format!("table {} is being cleared concurrently", self.name)));
        }
        Ok(head)
    }

    pub(crate) fn register(self: &Arc<Self>, tr: &mut Transaction) {
        if !tr.has_change(self.id) {
            tr.add_change(Box::new(TableChange::new(self.clone())));
        }
    }

    /// True when `tr` has touched the table's rows.
    pub fn in_transaction(&self, tr: &Transaction) -> bool {
        let head = self.storage.head();
        let segs = head.segments();
        let mut cur = Some(tr);
        while let Some(t) = cur {
            if head.ts() == t.tid || segs.in_transaction(t.tid) {
                return true;
            }
            cur = t.parent();
        }
        false
    }

    /// Reserve `cnt` row slots for `tr`.
    pub fn claim(self: &Arc<Self>, ctx: &StoreContext, tr: &mut Transaction, cnt: u64) -> Result<Claim> {
        let claim = {
            let _guard = ctx.lock_table(self.id);
            let storage = self.bind_del_data(tr)?;
            storage.segments_mut().claim(tr, cnt, ctx.oldest(), true)?
        };
        if cnt > 0 {
            self.register(tr);
            tr.add_log_changes(cnt);
        }
        Ok(claim)
    }

    /// Claim for tables with key constraints: refuses when committed rows are invisible to `tr`.
    pub fn key_claim(self: &Arc<Self>, ctx: &StoreContext, tr: &mut Transaction, cnt: u64) -> Result<Claim> {
        self.validate(ctx, tr, false)?;
        self.claim(ctx, tr, cnt)
    }

    /// Conflict when some segment is invisible to `tr`; committed ones only unless `uncommitted`.
    pub fn validate(&self, ctx: &StoreContext, tr: &Transaction, uncommitted: bool) -> Result<()> {
        let storage = self.storage.head();
        let _guard = ctx.lock_table(self.id);
        if storage.segments().conflicts(tr, uncommitted) {
            return Err(Error::conflict(format!("table {} changed after the snapshot", self.name)));
        }
        Ok(())
    }

    /// Some version `tr` cannot see holds an update of a row in `[start, start + len)`.
    fn deletes_conflict_updates(&self, tr: &Transaction, start: RowId, len: u64) -> bool {
        let end = start.saturating_add(len);
        self.columns.iter().any(|c| {
            let mut cur = Some(c.data.head());
            while let Some(d) = cur {
                if tr.valid_for_read(d.ts()) {
                    return false;
                }
                if d.state().updates.any_in(start, end) {
                    return true;
                }
                cur = d.next();
            }
            false
        })
    }

    /// Mark rows deleted for `tr`.
    ///
    /// Returns the number of rows newly deleted.
    pub fn delete(self: &Arc<Self>, ctx: &StoreContext, tr: &mut Transaction, rows: &RowSet) -> Result<u64> {
        let runs = rows.runs()?;
        if runs.is_empty() {
            return Ok(0);
        }
        let deleted = {
            let _guard = ctx.lock_table(self.id);
            let storage = self.bind_del_data(tr)?;
            let mut segs = storage.segments_mut();
            let mut conflicts = |start: RowId, len: u64| self.deletes_conflict_updates(tr, start, len);
            if let [(rid, 1)] = runs[..] {
                segs.delete_row(tr, rid, &mut conflicts).map(|()| 1)
            } else {
                runs.into_iter().try_fold(0, |n, (start, len)| -> Result<u64> {
                    Ok(n + segs.delete_range(tr, start, len, &mut conflicts)?)
                })
            }
        };
        // registered even on failure: earlier runs may already carry `tr`'s marks
        self.register(tr);
        let deleted = deleted?;
        tr.add_log_changes(deleted);
        Ok(deleted)
    }

    /// Rows of `[start, end)` present for `tr`.
    pub fn candidates(&self, ctx: &StoreContext, tr: &Transaction, start: RowId, end: RowId) -> Candidates {
        let storage = self.storage_for(tr);
        let _guard = ctx.lock_table(self.id);
        storage.segments().candidates(tr, start, end)
    }

    /// Candidates of part `part` when `[0, end)` is split into `parts` pieces.
    pub fn bind_candidates(&self, ctx: &StoreContext, tr: &Transaction, parts: u64, part: u64) -> Result<Candidates> {
        if parts == 0 || part >= parts {
            return Err(Error::InvalidOperation(format!("part {} of {}", part, parts)));
        }
        let end = self.storage_for(tr).segments().end_for(tr);
        let size = end / parts;
        let start = size * part;
        let stop = if part + 1 == parts { end } else { start + size };
        Ok(self.candidates(ctx, tr, start, stop))
    }

    pub fn count_deleted(&self, tr: &Transaction, mode: DeleteCount) -> u64 {
        let storage = self.storage_for(tr);
        match mode {
            DeleteCount::Deleted => storage.segments().count_deleted(tr),
            DeleteCount::Inserts => storage.segments().count_inserts(tr.tid),
            DeleteCount::Segments => storage.segments().len() as u64,
            DeleteCount::Bitmap => storage.deletes().bitmap.len(),
        }
    }

    /// Rows present for `tr`.
    pub fn count_active(&self, ctx: &StoreContext, tr: &Transaction) -> u64 {
        let storage = self.storage_for(tr);
        let _guard = ctx.lock_table(self.id);
        let segs = storage.segments();
        let end = segs.end_for(tr);
        end - segs.count_deleted_in_range(tr, 0, end)
    }

    /// Remove every row for `tr`; returns how many were present.
    ///
    /// An untouched table gets a fresh storage and empty column bases;
    /// otherwise the rows are marked deleted.
    pub fn clear(self: &Arc<Self>, ctx: &StoreContext, tr: &mut Transaction) -> Result<u64> {
        let in_transaction = {
            let _guard = ctx.lock_table(self.id);
            self.in_transaction(tr)
        };
        let active = self.count_active(ctx, tr);

        if in_transaction {
            {
                let _guard = ctx.lock_table(self.id);
                let storage = self.bind_del_data(tr)?;
                if storage.ts() == tr.tid {
                    storage.reset();
                } else {
                    let end = storage.segments().high_water();
                    let mut conflicts = |start: RowId, len: u64| self.deletes_conflict_updates(tr, start, len);
                    storage.segments_mut().delete_range(tr, 0, end, &mut conflicts)?;
                }
            }
            self.register(tr);
            return Ok(active);
        }

        {
            let _guard = ctx.lock_table(self.id);
            let head = self.bind_del_data(tr)?;
            if head.segments().conflicts(tr, true) {
                return Err(Error::conflict(format!("table {} has rows this transaction cannot see", self.name)));
            }
            let visible = self.storage.visible(tr);
            let fresh = Arc::new(TableStorage::cleared_for(tr.tid, visible.clone()));
            if !self.storage.compare_and_swap(&visible, fresh) {
                return Err(Error::conflict(format!("table {} changed concurrently", self.name)));
            }
        }
        self.register(tr);

        for idx in 0..self.columns.len() {
            let delta = self.own_delta(ctx, tr, idx)?;
            let _guard = ctx.lock_column(self.columns[idx].id());
            let empty = delta.base().read().empty_like();
            delta.replace_base(empty);
            delta.state_mut().nr_updates = 0;
        }
        debug!(table_id = self.id, tid = tr.tid, rows = active, "cleared table");
        Ok(active)
    }

    /// Rewrite column bases that accumulated enough updates and reused slots.
    pub fn vacuum(self: &Arc<Self>, ctx: &StoreContext, tr: &mut Transaction, force: bool) -> Result<()> {
        {
            let _guard = ctx.lock_table(self.id);
            if self.in_transaction(tr) {
                return Err(Error::conflict(format!("table {} was modified in this transaction", self.name)));
            }
        }
        let storage = self.bind_del_data(tr)?;
        let reused = storage.segments().nr_reused();
        let threshold = ctx.config().vacuum_threshold as u64;

        for idx in 0..self.columns.len() {
            let current = self.bind_col_data(tr, idx, false)?.0;
            let churn = current.state().nr_updates + reused;
            if !force && churn < threshold {
                continue;
            }
            let delta = self.own_delta(ctx, tr, idx)?;
            let _guard = ctx.lock_column(self.columns[idx].id());
            let (kind, len) = {
                let base = delta.base();
                let base = base.read();
                (base.kind(), base.len())
            };
            let values = materialize(&delta, tr, len)?;
            let rebuilt = match StorageArray::build(kind, values.clone(), ctx.tiers()) {
                Ok(arr) => arr,
                Err(Error::InvalidOperation(_)) => StorageArray::Plain(values),
                Err(e) => return Err(e),
            };
            delta.replace_base(rebuilt);
            delta.state_mut().nr_updates = 0;
            debug!(column_id = self.columns[idx].id(), churn, "vacuumed column");
        }

        let _guard = ctx.lock_table(self.id);
        storage.segments_mut().reset_reuse();
        Ok(())
    }

    /// Verify the head storage's chain partitions its row space.
    pub fn check_partition(&self) -> Result<()> {
        self.storage.head().segments().check_partition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::types::Value;
    use crate::wal::NullLogger;

    fn setup() -> (StoreContext, Arc<Table>) {
        let ctx = StoreContext::new(StoreConfig::default(), Arc::new(NullLogger)).unwrap();
        let table = Table::create(&ctx, "t", &[ColumnDef::new("c")]).unwrap();
        (ctx, table)
    }

    #[test]
    fn test_duplicate_columns_are_rejected() {
        let ctx = StoreContext::new(StoreConfig::default(), Arc::new(NullLogger)).unwrap();
        let err = Table::create(&ctx, "t", &[ColumnDef::new("a"), ColumnDef::new("a")]).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_claim_registers_one_change() {
        let (ctx, table) = setup();
        let mut tr = ctx.begin();
        table.claim(&ctx, &mut tr, 3).unwrap();
        table.claim(&ctx, &mut tr, 2).unwrap();
        assert_eq!(tr.change_count(), 1);
        assert_eq!(table.count_deleted(&tr, DeleteCount::Inserts), 5);
        ctx.commit(tr).unwrap();
    }

    #[test]
    fn test_bind_candidates_splits_range() {
        let (ctx, table) = setup();
        let mut tr = ctx.begin();
        let claim = table.claim(&ctx, &mut tr, 10).unwrap();
        let values: Vec<Value> = (0..10).map(Value::Int).collect();
        table.append(&ctx, &mut tr, "c", &claim, &values).unwrap();
        assert_eq!(table.bind_candidates(&ctx, &tr, 3, 0).unwrap(), Candidates::Dense(0..3));
        assert_eq!(table.bind_candidates(&ctx, &tr, 3, 2).unwrap(), Candidates::Dense(6..10));
        assert!(table.bind_candidates(&ctx, &tr, 3, 3).is_err());
        ctx.commit(tr).unwrap();
    }

    #[test]
    fn test_overflowing_row_range_is_rejected() {
        let (ctx, table) = setup();
        let mut tr = ctx.begin();
        let claim = table.claim(&ctx, &mut tr, 4).unwrap();
        let values: Vec<Value> = (0..4).map(Value::Int).collect();
        table.append(&ctx, &mut tr, "c", &claim, &values).unwrap();
        ctx.commit(tr).unwrap();

        let mut tr = ctx.begin();
        let rows = RowSet::range(u64::MAX - 1, 4);
        let err = table.delete(&ctx, &mut tr, &rows).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        let err = table.update(&ctx, &mut tr, "c", &rows, &values).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(table.count_active(&ctx, &tr), 4);
        ctx.commit(tr).unwrap();
    }

    #[test]
    fn test_delete_failing_on_a_later_run_rolls_back_cleanly() {
        let (ctx, table) = setup();
        let mut tr = ctx.begin();
        table.claim(&ctx, &mut tr, 6).unwrap();
        ctx.commit(tr).unwrap();

        let mut tr = ctx.begin();
        let err = table.delete(&ctx, &mut tr, &RowSet::Ids(vec![0, 1, 40])).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(tr.change_count(), 1);
        ctx.rollback(tr).unwrap();

        let tr = ctx.begin();
        assert_eq!(table.count_active(&ctx, &tr), 6);
        ctx.commit(tr).unwrap();
    }

    #[test]
    fn test_clear_in_transaction_marks_rows_deleted() {
        let (ctx, table) = setup();
        let mut tr = ctx.begin();
        table.claim(&ctx, &mut tr, 4).unwrap();
        assert_eq!(table.clear(&ctx, &mut tr).unwrap(), 4);
        assert_eq!(table.count_active(&ctx, &tr), 0);
        assert_eq!(table.storage_versions(), 1);
        ctx.commit(tr).unwrap();
    }

    #[test]
    fn test_vacuum_after_own_changes_conflicts() {
        let (ctx, table) = setup();
        let mut tr = ctx.begin();
        table.claim(&ctx, &mut tr, 1).unwrap();
        assert!(table.vacuum(&ctx, &mut tr, true).unwrap_err().is_conflict());
        ctx.rollback(tr).unwrap();
    }
}
