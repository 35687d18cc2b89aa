use std::sync::Arc;

use tracing::{debug, warn};

use super::chain::Versioned;
use super::column::Column;
use super::delta::{Delta, merge_delta};
use super::segment::Segment;
use super::table::{Table, TableStorage};
use crate::error::Result;
use crate::store::StoreContext;
use crate::transaction::{Change, CommitScope, Transaction};
use crate::types::{ObjectId, RowId, Timestamp, is_transaction_id};

/// Change entry for a table's row-visibility storage.
pub struct TableChange {
    table: Arc<Table>,
    storage: Option<Arc<TableStorage>>,
    retired: Vec<Segment>,
    ts: Timestamp,
    rolled_back: bool,
}

impl TableChange {
    pub fn new(table: Arc<Table>) -> Self {
        TableChange {
            storage: Some(table.storage.head()),
            table,
            retired: Vec::new(),
            ts: 0,
            rolled_back: false,
        }
    }

    fn park(&mut self, ctx: &StoreContext, retired: Vec<Segment>) {
        if !retired.is_empty() {
            ctx.park_retired(retired.len());
            self.retired.extend(retired);
        }
    }

    fn release(&mut self, ctx: &StoreContext, oldest: Timestamp) {
        let before = self.retired.len();
        self.retired.retain(|s| s.ts > oldest);
        ctx.release_retired(before - self.retired.len());
    }

    fn log_segments(&self, ctx: &StoreContext, tr: &Transaction, storage: &TableStorage) -> Result<()> {
        let ranges: Vec<Segment> = {
            let segs = storage.segments();
            let last = segs.len().saturating_sub(1);
            segs.iter()
                .enumerate()
                .filter(|(i, s)| s.ts == tr.tid && !s.is_empty() && (*i != last || !s.deleted || s.ts != s.oldts))
                .map(|(_, s)| *s)
                .collect()
        };
        for s in ranges {
            ctx.logger().log_segment_range(self.table.id(), s.start, s.len(), s.deleted)?;
        }
        Ok(())
    }

    fn log_appends(&self, ctx: &StoreContext, tr: &Transaction, storage: &TableStorage) -> Result<()> {
        let (ranges, end): (Vec<(RowId, RowId)>, RowId) = {
            let segs = storage.segments();
            let end = segs.end_for(tr);
            let ranges = segs
                .iter()
                .filter(|s| s.ts == tr.tid && !s.deleted && s.start < end)
                .map(|s| (s.start, s.end.min(end)))
                .collect();
            (ranges, end)
        };
        if ranges.is_empty() {
            return Ok(());
        }
        for idx in 0..self.table.columns().len() {
            let column = &self.table.columns()[idx];
            let delta = self.table.append_delta(tr, idx);
            if delta.ts() == tr.tid && delta.is_cleared() {
                // the column change logs the whole base
                continue;
            }
            let base = delta.base();
            for (start, stop) in &ranges {
                let values = base.read().decode_range(*start, *stop);
                ctx.logger().log_column_append(column.id(), *start, &values)?;
            }
        }
        debug!(table_id = self.table.id(), ranges = ranges.len(), end, "logged appends");
        Ok(())
    }
}

impl Change for TableChange {
    fn object_id(&self) -> ObjectId {
        self.table.id()
    }

    fn is_logged(&self) -> bool {
        self.table.is_logged()
    }

    fn log(&self, ctx: &StoreContext, tr: &Transaction) -> Result<()> {
        if tr.is_savepoint() {
            return Ok(());
        }
        let storage = self.table.storage.head();
        let cleared = storage.ts() == tr.tid && storage.is_cleared();
        if cleared {
            ctx.logger().log_table_clear(self.table.id())?;
        }
        self.log_segments(ctx, tr, &storage)?;
        if !cleared {
            self.log_appends(ctx, tr, &storage)?;
        }
        Ok(())
    }

    fn commit(&mut self, ctx: &StoreContext, tr: &Transaction, scope: &CommitScope<'_>) -> Result<()> {
        let _guard = ctx.lock_table(self.table.id());
        let head = self.table.storage.head();

        if scope.is_rollback() {
            if head.ts() == tr.tid {
                self.table.storage.unlink(&head);
                self.rolled_back = true;
            } else {
                let retired = head.segments_mut().rollback(tr, scope.oldest, ctx.timestamp());
                self.park(ctx, retired);
            }
            self.storage = Some(head);
            return Ok(());
        }

        if is_transaction_id(scope.commit_ts) {
            head.segments_mut()
                .merge(tr.tid, scope.commit_ts, scope.oldest, scope.active);
            if head.ts() == tr.tid {
                head.set_ts(scope.commit_ts);
                if let Some(parent) = head.next()
                    && parent.ts() == scope.commit_ts
                {
                    head.set_next_version(parent.next());
                }
            }
            self.storage = Some(head);
            return Ok(());
        }

        if head.ts() == tr.tid {
            head.set_ts(scope.commit_ts);
        }
        {
            let segs = head.segments();
            let mut deletes = head.deletes_mut();
            let deletes = &mut *deletes;
            segs.materialize_deletes(tr, &mut deletes.bitmap, &mut deletes.count);
        }
        let retired = head
            .segments_mut()
            .merge(tr.tid, scope.commit_ts, scope.oldest, scope.active);
        self.park(ctx, retired);
        if scope.oldest == scope.commit_ts {
            head.set_next_version(None);
        }
        head.set_cleared(false);
        self.storage = Some(head);
        Ok(())
    }

    fn cleanup(&mut self, ctx: &StoreContext, oldest: Timestamp) -> bool {
        self.release(ctx, oldest);
        let Some(storage) = self.storage.clone() else {
            return self.retired.is_empty();
        };
        if self.rolled_back {
            let ts = storage.ts();
            if ts <= oldest {
                return self.retired.is_empty();
            }
            if is_transaction_id(ts) {
                storage.set_ts(ctx.timestamp() + 1);
            }
            return false;
        }
        if !self.table.storage.is_head(&storage) {
            return self.retired.is_empty();
        }
        if is_transaction_id(oldest) {
            return false;
        }
        if storage.next().is_some() {
            if storage.ts() > oldest {
                return false;
            }
            storage.set_next_version(None);
        }
        self.retired.is_empty()
    }

    fn ts(&self) -> Timestamp {
        self.ts
    }

    fn set_ts(&mut self, ts: Timestamp) {
        self.ts = ts;
    }
}

/// Change entry for one transaction-owned version of a column.
pub struct ColumnChange {
    table: Arc<Table>,
    column: usize,
    delta: Arc<Delta>,
    ts: Timestamp,
    rolled_back: bool,
}

impl ColumnChange {
    pub fn new(table: Arc<Table>, column: usize, delta: Arc<Delta>, ts: Timestamp) -> Self {
        ColumnChange {
            table,
            column,
            delta,
            ts,
            rolled_back: false,
        }
    }

    fn column(&self) -> &Column {
        &self.table.columns()[self.column]
    }
}

impl Change for ColumnChange {
    fn object_id(&self) -> ObjectId {
        self.column().id()
    }

    fn is_logged(&self) -> bool {
        self.table.is_logged()
    }

    fn log(&self, ctx: &StoreContext, tr: &Transaction) -> Result<()> {
        if tr.is_savepoint() {
            return Ok(());
        }
        let column = self.column();
        let head = column.head();
        let st = head.state();
        if st.cleared {
            let end = self.table.storage_for(tr).segments().end_for(tr);
            let values = st.base.read().decode_range(0, end);
            ctx.logger().log_column_replace(column.id(), &values)
        } else if !st.updates.is_empty() {
            ctx.logger()
                .log_column_update(column.id(), st.updates.ids(), st.updates.values())
        } else {
            Ok(())
        }
    }

    fn commit(&mut self, ctx: &StoreContext, _tr: &Transaction, scope: &CommitScope<'_>) -> Result<()> {
        let column = self.column();
        if scope.is_rollback() {
            column.data.unlink(&self.delta);
            self.rolled_back = true;
            return Ok(());
        }
        self.delta.set_ts(scope.commit_ts);

        if is_transaction_id(scope.commit_ts) {
            if let Some(parent) = self.delta.next()
                && parent.ts() == scope.commit_ts
            {
                let _guard = ctx.lock_column(column.id());
                parent.absorb(&self.delta)?;
                column.data.unlink(&self.delta);
            }
            return Ok(());
        }

        let head = column.head();
        let mut cur = Some(head.clone());
        while let Some(d) = cur.clone() {
            if d.ts() <= scope.oldest {
                break;
            }
            cur = d.next();
        }
        if let Some(d) = cur
            && !d.is_merged()
        {
            let _guard = ctx.lock_column(column.id());
            // a failed fold is retried by cleanup; the commit itself already took effect
            match merge_delta(&d) {
                Ok(folded) => head.state_mut().nr_updates += folded,
                Err(e) => warn!(column_id = column.id(), error = %e, "folding committed updates deferred"),
            }
        }
        Ok(())
    }

    fn cleanup(&mut self, ctx: &StoreContext, oldest: Timestamp) -> bool {
        if self.rolled_back {
            let ts = self.delta.ts();
            if ts <= oldest {
                return true;
            }
            if is_transaction_id(ts) {
                self.delta.set_ts(ctx.timestamp() + 1);
            }
            return false;
        }
        let column = self.column();
        if !column.data.is_head(&self.delta) {
            return true;
        }
        if is_transaction_id(oldest) {
            return false;
        }
        if self.delta.next().is_some() {
            if self.delta.ts() > oldest {
                return false;
            }
            let _guard = ctx.lock_column(column.id());
            match merge_delta(&self.delta) {
                Ok(folded) => self.delta.state_mut().nr_updates += folded,
                Err(e) => {
                    warn!(column_id = column.id(), error = %e, "merging column versions failed");
                    return false;
                }
            }
            self.delta.set_next_version(None);
        }
        true
    }

    fn ts(&self) -> Timestamp {
        self.ts
    }

    fn set_ts(&mut self, ts: Timestamp) {
        self.ts = ts;
    }
}
