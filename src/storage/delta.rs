use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::array::{StorageArray, StorageKind};
use super::chain::Versioned;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::{RowId, Timestamp, Value};

/// Pending `(row id, value)` overrides, sorted by row id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSet {
    ids: Vec<RowId>,
    values: Vec<Value>,
}

impl UpdateSet {
    pub fn new() -> Self {
        UpdateSet::default()
    }

    /// Build from unsorted pairs; on duplicate ids the later pair wins.
    pub fn from_pairs(mut pairs: Vec<(RowId, Value)>) -> Self {
        pairs.sort_by_key(|(rid, _)| *rid);
        let mut set = UpdateSet {
            ids: Vec::with_capacity(pairs.len()),
            values: Vec::with_capacity(pairs.len()),
        };
        for (rid, value) in pairs {
            if set.ids.last() == Some(&rid) {
                if let Some(last) = set.values.last_mut() {
                    *last = value;
                }
                continue;
            }
            set.ids.push(rid);
            set.values.push(value);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[RowId] {
        &self.ids
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, rid: RowId) -> Option<&Value> {
        self.ids.binary_search(&rid).ok().map(|i| &self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (RowId, &Value)> {
        self.ids.iter().copied().zip(self.values.iter())
    }

    /// True when some id falls in `[start, end)`.
    pub fn any_in(&self, start: RowId, end: RowId) -> bool {
        let i = self.ids.partition_point(|&rid| rid < start);
        self.ids.get(i).is_some_and(|&rid| rid < end)
    }

    /// Entries with ids below `end`.
    pub fn below(&self, end: RowId) -> UpdateSet {
        let n = self.ids.partition_point(|&rid| rid < end);
        UpdateSet {
            ids: self.ids[..n].to_vec(),
            values: self.values[..n].to_vec(),
        }
    }

    /// Two-pointer merge by ascending id; `newer` wins on equal ids.
    pub fn merge(newer: &UpdateSet, older: &UpdateSet) -> Result<UpdateSet> {
        let total = newer.len() + older.len();
        let mut ids = Vec::new();
        let mut values = Vec::new();
        ids.try_reserve(total)?;
        values.try_reserve(total)?;

        let (mut n, mut o) = (0, 0);
        while n < newer.len() && o < older.len() {
            let (nid, oid) = (newer.ids[n], older.ids[o]);
            if nid <= oid {
                ids.push(nid);
                values.push(newer.values[n].clone());
                n += 1;
                if nid == oid {
                    o += 1;
                }
            } else {
                ids.push(oid);
                values.push(older.values[o].clone());
                o += 1;
            }
        }
        ids.extend_from_slice(&newer.ids[n..]);
        values.extend_from_slice(&newer.values[n..]);
        ids.extend_from_slice(&older.ids[o..]);
        values.extend_from_slice(&older.values[o..]);
        Ok(UpdateSet { ids, values })
    }
}

/// Mutable part of a [`Delta`].
#[derive(Debug)]
pub struct DeltaState {
    /// Base array, shared with older deltas until a delta is cleared.
    pub base: Arc<RwLock<StorageArray>>,
    pub updates: UpdateSet,
    /// The base was replaced wholesale by this delta.
    pub cleared: bool,
    /// Updates are folded into the base.
    pub merged: bool,
    /// Updates folded since the last vacuum.
    pub nr_updates: u64,
}

/// One version of a column's storage.
#[derive(Debug)]
pub struct Delta {
    ts: AtomicU64,
    state: RwLock<DeltaState>,
    next: RwLock<Option<Arc<Delta>>>,
}

impl Versioned for Delta {
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

impl Delta {
    pub fn new(base: StorageArray, ts: Timestamp) -> Self {
        Delta {
            ts: AtomicU64::new(ts),
            state: RwLock::new(DeltaState {
                base: Arc::new(RwLock::new(base)),
                updates: UpdateSet::new(),
                cleared: false,
                merged: true,
                nr_updates: 0,
            }),
            next: RwLock::new(None),
        }
    }

    /// A version for `tid` stacked on `self`, sharing its base.
    pub fn duplicate(self: &Arc<Self>, tid: Timestamp) -> Delta {
        let st = self.state.read();
        Delta {
            ts: AtomicU64::new(tid),
            state: RwLock::new(DeltaState {
                base: st.base.clone(),
                updates: UpdateSet::new(),
                cleared: false,
                merged: true,
                nr_updates: st.nr_updates,
            }),
            next: RwLock::new(Some(self.clone())),
        }
    }

    pub fn ts(&self) -> Timestamp {
        self.ts.load(Ordering::Acquire)
    }

    pub fn set_ts(&self, ts: Timestamp) {
        self.ts.store(ts, Ordering::Release);
    }

    pub fn next(&self) -> Option<Arc<Delta>> {
        self.next_version()
    }

    pub fn state(&self) -> RwLockReadGuard<'_, DeltaState> {
        self.state.read()
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, DeltaState> {
        self.state.write()
    }

    pub fn base(&self) -> Arc<RwLock<StorageArray>> {
        self.state.read().base.clone()
    }

    pub fn kind(&self) -> StorageKind {
        self.base().read().kind()
    }

    pub fn ucnt(&self) -> u64 {
        self.state.read().updates.len() as u64
    }

    pub fn is_cleared(&self) -> bool {
        self.state.read().cleared
    }

    pub fn is_merged(&self) -> bool {
        self.state.read().merged
    }

    /// Give this version a private base and drop its updates.
    pub fn replace_base(&self, base: StorageArray) {
        let mut st = self.state.write();
        st.base = Arc::new(RwLock::new(base));
        st.updates = UpdateSet::new();
        st.cleared = true;
    }

    /// Write the pending updates into the base.
    ///
    /// Returns the number of updates folded.
    pub fn fold_updates(&self) -> Result<u64> {
        let mut st = self.state.write();
        let n = st.updates.len() as u64;
        if n > 0 {
            st.base.write().apply(st.updates.ids(), st.updates.values())?;
            st.updates = UpdateSet::new();
        }
        st.cleared = false;
        st.merged = true;
        Ok(n)
    }

    /// Fold a savepoint's version of the same column into this one.
    pub fn absorb(&self, child: &Delta) -> Result<()> {
        let child = child.state.read();
        let mut st = self.state.write();
        st.updates = if child.cleared {
            child.updates.clone()
        } else {
            UpdateSet::merge(&child.updates, &st.updates)?
        };
        st.base = child.base.clone();
        st.cleared |= child.cleared;
        st.merged = st.updates.is_empty() && st.merged && child.merged;
        st.nr_updates = st.nr_updates.max(child.nr_updates);
        Ok(())
    }
}

/// Next older version with live updates `tr` can see, stopping at merged ones.
pub fn older_delta(d: &Delta, tr: &Transaction) -> Option<Arc<Delta>> {
    let mut o = d.next();
    while let Some(cur) = o {
        if cur.is_merged() {
            return None;
        }
        if cur.ucnt() > 0 && tr.valid_for_read(cur.ts()) {
            return Some(cur);
        }
        o = cur.next();
    }
    None
}

/// Updates of `d` and every older visible layer that shares its base,
/// merged newest-first and cut at `end`.
pub fn merged_updates(d: &Arc<Delta>, tr: &Transaction, end: RowId) -> Result<UpdateSet> {
    let mut acc = d.state().updates.below(end);
    if d.is_cleared() {
        return Ok(acc);
    }
    let mut cur = d.clone();
    while let Some(older) = older_delta(&cur, tr) {
        let layer = older.state().updates.below(end);
        acc = UpdateSet::merge(&acc, &layer)?;
        if older.is_cleared() {
            break;
        }
        cur = older;
    }
    Ok(acc)
}

/// Rows `[0, end)` of `d` as `tr` sees them.
pub fn materialize(d: &Arc<Delta>, tr: &Transaction, end: RowId) -> Result<Vec<Value>> {
    let updates = merged_updates(d, tr, end)?;
    let mut values = d.base().read().decode_range(0, end);
    for (rid, value) in updates.iter() {
        match values.get_mut(rid as usize) {
            Some(slot) => *slot = value.clone(),
            None => return Err(Error::internal(format!("update of row {} past base end {}", rid, values.len()))),
        }
    }
    Ok(values)
}

/// Fold `d` and its unmerged predecessors, oldest first.
///
/// Returns the number of updates folded.
pub fn merge_delta(d: &Arc<Delta>) -> Result<u64> {
    let mut chain = vec![d.clone()];
    let mut cur = d.clone();
    while !cur.is_merged() {
        match cur.next() {
            Some(next) => {
                chain.push(next.clone());
                cur = next;
            }
            None => break,
        }
    }
    let mut folded = 0;
    for delta in chain.iter().rev() {
        folded += delta.fold_updates()?;
    }
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TRANSACTION_ID_BASE;

    fn set(pairs: &[(RowId, i64)]) -> UpdateSet {
        UpdateSet::from_pairs(pairs.iter().map(|&(r, v)| (r, Value::Int(v))).collect())
    }

    fn base(n: i64) -> StorageArray {
        StorageArray::Plain((0..n).map(Value::Int).collect())
    }

    #[test]
    fn test_from_pairs_sorts_and_keeps_last() {
        let s = set(&[(5, 1), (2, 2), (5, 3)]);
        assert_eq!(s.ids(), &[2, 5]);
        assert_eq!(s.get(5), Some(&Value::Int(3)));
    }

    #[test]
    fn test_merge_prefers_newer() {
        let newer = set(&[(1, 10), (4, 40)]);
        let older = set(&[(1, 1), (2, 2), (7, 7)]);
        let merged = UpdateSet::merge(&newer, &older).unwrap();
        assert_eq!(merged.ids(), &[1, 2, 4, 7]);
        assert_eq!(merged.values(), &[Value::Int(10), Value::Int(2), Value::Int(40), Value::Int(7)]);
        assert_eq!(merged.below(4).ids(), &[1, 2]);
    }

    #[test]
    fn test_merged_updates_walks_visible_layers() {
        let committed = Arc::new(Delta::new(base(10), 1));
        {
            let mut st = committed.state_mut();
            st.updates = set(&[(3, 30)]);
            st.merged = false;
        }
        committed.set_ts(5);
        let mine = Arc::new(committed.duplicate(TRANSACTION_ID_BASE + 1));
        mine.state_mut().updates = set(&[(3, 33), (8, 80)]);

        let tr = Transaction::new(TRANSACTION_ID_BASE + 1, 10, None);
        let all = merged_updates(&mine, &tr, 10).unwrap();
        assert_eq!(all.get(3), Some(&Value::Int(33)));
        assert_eq!(all.len(), 2);

        // a snapshot older than the committed layer skips it
        let old = Transaction::new(TRANSACTION_ID_BASE + 2, 4, None);
        assert!(older_delta(&mine, &old).is_none());

        let values = materialize(&mine, &tr, 10).unwrap();
        assert_eq!(values[3], Value::Int(33));
        assert_eq!(values[8], Value::Int(80));
    }

    #[test]
    fn test_merge_delta_folds_oldest_first() {
        let older = Arc::new(Delta::new(base(5), 2));
        {
            let mut st = older.state_mut();
            st.updates = set(&[(1, 100), (2, 200)]);
            st.merged = false;
        }
        let newer = Arc::new(older.duplicate(3));
        {
            let mut st = newer.state_mut();
            st.updates = set(&[(1, 111)]);
            st.merged = false;
        }
        assert_eq!(merge_delta(&newer).unwrap(), 3);
        assert!(older.is_merged() && newer.is_merged());
        let arr = newer.base();
        let arr = arr.read();
        assert_eq!(arr.get(1), Some(Value::Int(111)));
        assert_eq!(arr.get(2), Some(Value::Int(200)));
    }

    #[test]
    fn test_absorb_child_wins() {
        let parent = Arc::new(Delta::new(base(5), TRANSACTION_ID_BASE + 1));
        parent.state_mut().updates = set(&[(0, 1), (1, 1)]);
        let child = Arc::new(parent.duplicate(TRANSACTION_ID_BASE + 2));
        child.state_mut().updates = set(&[(1, 2)]);
        parent.absorb(&child).unwrap();
        let st = parent.state();
        assert_eq!(st.updates.get(0), Some(&Value::Int(1)));
        assert_eq!(st.updates.get(1), Some(&Value::Int(2)));
    }
}
