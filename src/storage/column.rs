use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::array::{Fit, StorageArray, StorageKind};
use super::chain::VersionChain;
use super::changes::ColumnChange;
use super::delta::{Delta, UpdateSet, materialize, merged_updates};
use super::segment::Claim;
use super::table::Table;
use crate::error::{Error, Result};
use crate::store::StoreContext;
use crate::transaction::Transaction;
use crate::types::{ObjectId, RowId, RowSet, Value, is_transaction_id};

/// How a caller wants to see a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Base values without pending updates.
    ReadOnly,
    /// Representation and length only.
    Quick,
    /// The dictionary of a dictionary-encoded base.
    ReadExtra,
    /// Row ids of the updates visible to the transaction.
    UpdateIds,
    /// Values of the updates visible to the transaction.
    UpdateValues,
}

/// What [`Table::count`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    /// Pending updates in the visible version.
    Updates,
    /// Rows inserted by the transaction.
    Inserts,
    /// Tail end of the chain, ignoring visibility.
    Quick,
    /// Rows present for the transaction.
    Active,
    /// Row space visible to the transaction.
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnView {
    Values(Vec<Value>),
    Quick { kind: StorageKind, len: u64 },
    Dictionary(Vec<Value>),
    UpdateIds(Vec<RowId>),
    UpdateValues(Vec<Value>),
}

struct CachedBounds {
    base: Weak<RwLock<StorageArray>>,
    len: u64,
    bounds: Option<(Value, Value)>,
}

/// A column: a chain of deltas, newest first.
pub struct Column {
    id: ObjectId,
    name: String,
    pub(crate) data: VersionChain<Delta>,
    bounds: Mutex<Option<CachedBounds>>,
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("versions", &self.data.depth())
            .finish()
    }
}

impl Column {
    pub(crate) fn new(id: ObjectId, name: String, initial: Delta) -> Self {
        Column {
            id,
            name,
            data: VersionChain::new(initial),
            bounds: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn versions(&self) -> usize {
        self.data.depth()
    }

    pub fn head(&self) -> Arc<Delta> {
        self.data.head()
    }

    /// Base min/max, recomputed only when the base array or its length changed.
    fn base_bounds(&self, base: &Arc<RwLock<StorageArray>>) -> Option<(Value, Value)> {
        let len = base.read().len();
        let mut cache = self.bounds.lock();
        if let Some(c) = cache.as_ref()
            && c.len == len
            && c.base.upgrade().is_some_and(|b| Arc::ptr_eq(&b, base))
        {
            return c.bounds.clone();
        }
        let bounds = base.read().min_max();
        *cache = Some(CachedBounds {
            base: Arc::downgrade(base),
            len,
            bounds: bounds.clone(),
        });
        bounds
    }
}

impl Table {
    /// Delta of column `idx` that `tr` may write into.
    ///
    /// Append mode reuses the head when `tr` may extend it; update mode
    /// stacks a private version and swaps it in. Returns whether a version
    /// was created.
    pub(crate) fn bind_col_data(&self, tr: &Transaction, idx: usize, for_update: bool) -> Result<(Arc<Delta>, bool)> {
        let column = &self.columns[idx];
        let head = column.data.head();
        let ts = head.ts();
        if ts == tr.tid || (!for_update && (!is_transaction_id(ts) || tr.is_version_of_parent(ts))) {
            return Ok((head, false));
        }
        if is_transaction_id(ts) && !tr.is_version_of_parent(ts) {
            if !for_update && !head.is_cleared() {
                return Ok((column.data.visible(tr), false));
            }
            return Err(Error::conflict(format!("column {} is being modified concurrently", column.name)));
        }
        let visible = column.data.visible(tr);
        let fresh = Arc::new(visible.duplicate(tr.tid));
        if !column.data.compare_and_swap(&visible, fresh.clone()) {
            return Err(Error::conflict(format!("column {} changed after the snapshot", column.name)));
        }
        Ok((fresh, true))
    }

    /// A version of column `idx` owned by `tr`, registering its change on creation.
    pub(crate) fn own_delta(self: &Arc<Self>, ctx: &StoreContext, tr: &mut Transaction, idx: usize) -> Result<Arc<Delta>> {
        let (delta, created) = self.bind_col_data(tr, idx, true)?;
        if created {
            debug!(column_id = self.columns[idx].id(), tid = tr.tid, "new column version");
            tr.add_change(Box::new(ColumnChange::new(self.clone(), idx, delta.clone(), ctx.timestamp())));
        }
        Ok(delta)
    }

    /// Delta holding `tr`'s appended values for column `idx`.
    pub(crate) fn append_delta(&self, tr: &Transaction, idx: usize) -> Arc<Delta> {
        let column = &self.columns[idx];
        let head = column.data.head();
        let ts = head.ts();
        if ts == tr.tid || !is_transaction_id(ts) || tr.is_version_of_parent(ts) {
            head
        } else {
            column.data.visible(tr)
        }
    }

    /// Give a `tr`-owned delta a private base in the representation `fit` asks for,
    /// with the updates it sees folded in.
    fn rebase(&self, tr: &Transaction, delta: &Arc<Delta>, fit: Fit) -> Result<()> {
        let base = delta.base();
        let len = base.read().len();
        let updates = merged_updates(delta, tr, len)?;
        let mut rebuilt = base.read().reencode(fit)?;
        rebuilt.apply(updates.ids(), updates.values())?;
        debug!(?fit, kind = ?rebuilt.kind(), rows = len, "rebased column version");
        delta.replace_base(rebuilt);
        Ok(())
    }

    fn rows_end(&self, tr: &Transaction) -> RowId {
        self.storage_for(tr).segments().end_for(tr)
    }

    /// Column `col` viewed through `mode`.
    pub fn bind(&self, tr: &Transaction, col: &str, mode: AccessMode) -> Result<ColumnView> {
        let idx = self.column_index(col)?;
        let delta = self.columns[idx].data.visible(tr);
        let end = self.rows_end(tr);
        let view = match mode {
            AccessMode::ReadOnly => ColumnView::Values(delta.base().read().decode_range(0, end)),
            AccessMode::Quick => {
                let base = delta.base();
                let base = base.read();
                ColumnView::Quick {
                    kind: base.kind(),
                    len: base.len(),
                }
            }
            AccessMode::ReadExtra => {
                let base = delta.base();
                let base = base.read();
                let dict = base
                    .dictionary()
                    .ok_or_else(|| Error::InvalidOperation(format!("column {} has no dictionary", col)))?;
                ColumnView::Dictionary(dict.values().to_vec())
            }
            AccessMode::UpdateIds => ColumnView::UpdateIds(merged_updates(&delta, tr, end)?.ids().to_vec()),
            AccessMode::UpdateValues => {
                ColumnView::UpdateValues(merged_updates(&delta, tr, end)?.values().to_vec())
            }
        };
        Ok(view)
    }

    /// Write values for rows `tr` claimed.
    pub fn append(
        self: &Arc<Self>,
        ctx: &StoreContext,
        tr: &mut Transaction,
        col: &str,
        claim: &Claim,
        values: &[Value],
    ) -> Result<()> {
        let idx = self.column_index(col)?;
        if claim.len() != values.len() as u64 {
            return Err(Error::InvalidOperation(format!(
                "{} values for {} claimed rows",
                values.len(),
                claim.len()
            )));
        }
        if values.is_empty() {
            return Ok(());
        }
        // bind under the lock so a concurrent rebase cannot swap the base in between
        let _guard = ctx.lock_column(self.columns[idx].id());
        let (mut delta, _) = self.bind_col_data(tr, idx, false)?;

        let fit = delta.base().read().fit(values, ctx.tiers());
        if fit != Fit::Fits {
            delta = self.own_delta(ctx, tr, idx)?;
            self.rebase(tr, &delta, fit)?;
        }

        {
            let base = delta.base();
            let mut base = base.write();
            match claim {
                Claim::Dense { start, .. } => base.write_at(*start, values)?,
                Claim::Offsets(offsets) => {
                    let split = claim.start_of_appends(base.len());
                    for (rid, value) in offsets[..split].iter().zip(values) {
                        base.write_at(*rid, std::slice::from_ref(value))?;
                    }
                    if let Some(first) = offsets.get(split) {
                        base.write_at(*first, &values[split..])?;
                    }
                }
            }
        }
        delta.state_mut().merged = false;
        self.register(tr);
        Ok(())
    }

    /// Replace values of existing rows.
    ///
    /// Rows `tr` inserted itself are rewritten in place; others go into the
    /// update set of `tr`'s version of the column.
    pub fn update(
        self: &Arc<Self>,
        ctx: &StoreContext,
        tr: &mut Transaction,
        col: &str,
        rows: &RowSet,
        values: &[Value],
    ) -> Result<()> {
        let idx = self.column_index(col)?;
        let ids = rows.to_vec()?;
        if ids.len() != values.len() {
            return Err(Error::InvalidOperation(format!(
                "{} values for {} rows",
                values.len(),
                ids.len()
            )));
        }
        if ids.is_empty() {
            return Ok(());
        }
        let n = ids.len() as u64;
        let delta = self.own_delta(ctx, tr, idx)?;

        let _table = ctx.lock_table(self.id());
        let _column = ctx.lock_column(self.columns[idx].id());
        let storage = self.bind_del_data(tr)?;
        let updates = UpdateSet::from_pairs(ids.into_iter().zip(values.iter().cloned()).collect());

        let in_place: Vec<bool> = {
            let segs = storage.segments();
            let high = segs.high_water();
            for rid in updates.ids() {
                if *rid >= high {
                    return Err(Error::InvalidOperation(format!(
                        "row {} is beyond the table end {}",
                        rid, high
                    )));
                }
                if segs.is_deleted_since(tr, *rid) {
                    return Err(Error::conflict(format!("row {} was deleted concurrently", rid)));
                }
            }
            updates.ids().iter().map(|rid| segs.is_append(tr.tid, *rid)).collect()
        };

        let fit = delta.base().read().fit(updates.values(), ctx.tiers());
        if fit != Fit::Fits {
            self.rebase(tr, &delta, fit)?;
        }
        let base = delta.base();
        base.write().intern_all(updates.values())?;

        let cleared = delta.is_cleared();
        let mut deferred = Vec::new();
        {
            let mut base = base.write();
            for ((rid, value), direct) in updates.iter().zip(in_place) {
                if cleared || direct {
                    base.write_at(rid, std::slice::from_ref(value))?;
                } else {
                    deferred.push((rid, value.clone()));
                }
            }
        }
        if !deferred.is_empty() {
            let mut st = delta.state_mut();
            st.updates = UpdateSet::merge(&UpdateSet::from_pairs(deferred), &st.updates)?;
            st.merged = false;
        }
        tr.add_log_changes(n);
        Ok(())
    }

    pub fn count(&self, ctx: &StoreContext, tr: &Transaction, col: &str, mode: CountMode) -> Result<u64> {
        let idx = self.column_index(col)?;
        let n = match mode {
            CountMode::Updates => self.columns[idx].data.visible(tr).ucnt(),
            CountMode::Inserts => self.storage_for(tr).segments().count_inserts(tr.tid),
            CountMode::Quick => self.storage_for(tr).segments().high_water(),
            CountMode::Active => self.count_active(ctx, tr),
            CountMode::End => self.rows_end(tr),
        };
        Ok(n)
    }

    /// Re-encode column `col` as `kind` in a version private to `tr`.
    pub fn compress(
        self: &Arc<Self>,
        ctx: &StoreContext,
        tr: &mut Transaction,
        col: &str,
        kind: StorageKind,
    ) -> Result<()> {
        let idx = self.column_index(col)?;
        {
            let _guard = ctx.lock_table(self.id());
            if self.in_transaction(tr) {
                return Err(Error::conflict(format!(
                    "table {} was modified in this transaction",
                    self.name()
                )));
            }
        }
        let delta = self.own_delta(ctx, tr, idx)?;
        let _guard = ctx.lock_column(self.columns[idx].id());
        let len = delta.base().read().len();
        let values = materialize(&delta, tr, len)?;
        let compressed = StorageArray::build(kind, values, ctx.tiers())?;
        debug!(column_id = self.columns[idx].id(), ?kind, rows = len, "compressed column");
        delta.replace_base(compressed);
        Ok(())
    }

    /// Smallest and largest value `tr` sees; unknown for frame-of-reference bases.
    ///
    /// Without updates to apply this answers from the whole base, so deleted rows
    /// may widen the bounds.
    pub fn min_max(&self, tr: &Transaction, col: &str) -> Result<Option<(Value, Value)>> {
        let idx = self.column_index(col)?;
        let column = &self.columns[idx];
        let delta = column.data.visible(tr);
        let end = self.rows_end(tr);
        if delta.kind() == StorageKind::FrameOfReference {
            return Ok(None);
        }
        if merged_updates(&delta, tr, end)?.is_empty() {
            return Ok(column.base_bounds(&delta.base()));
        }
        Ok(StorageArray::Plain(materialize(&delta, tr, end)?).min_max())
    }

    /// Whether the values `tr` sees ascend; known for plain storage only.
    pub fn is_sorted(&self, tr: &Transaction, col: &str) -> Result<Option<bool>> {
        let idx = self.column_index(col)?;
        let delta = self.columns[idx].data.visible(tr);
        if delta.kind() != StorageKind::Plain {
            return Ok(None);
        }
        let end = self.rows_end(tr);
        Ok(StorageArray::Plain(materialize(&delta, tr, end)?).is_sorted())
    }

    /// Values of rows `[0, end)` as `tr` sees them, deleted rows included.
    pub fn read(&self, tr: &Transaction, col: &str) -> Result<Vec<Value>> {
        let idx = self.column_index(col)?;
        let delta = self.columns[idx].data.visible(tr);
        materialize(&delta, tr, self.rows_end(tr))
    }

    /// Live rows of column `col` for `tr`.
    pub fn scan(&self, ctx: &StoreContext, tr: &Transaction, col: &str) -> Result<Vec<(RowId, Value)>> {
        let values = self.read(tr, col)?;
        let end = values.len() as RowId;
        let rows = self.candidates(ctx, tr, 0, end);
        Ok(rows
            .to_vec()
            .into_iter()
            .filter_map(|rid| values.get(rid as usize).map(|v| (rid, v.clone())))
            .collect())
    }
}
