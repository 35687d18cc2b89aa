use std::fmt;

use ulid::Ulid;

use crate::error::Result;
use crate::store::StoreContext;
use crate::types::{ObjectId, Timestamp};

/// What a change's commit callback is asked to do.
#[derive(Debug, Clone, Copy)]
pub struct CommitScope<'a> {
    /// Commit timestamp, the parent's tid for savepoints, or 0 for rollback.
    pub commit_ts: Timestamp,
    /// Oldest snapshot any other transaction may still read.
    pub oldest: Timestamp,
    /// Snapshot timestamps of the other active transactions.
    pub active: &'a [Timestamp],
}

impl CommitScope<'_> {
    pub fn is_rollback(&self) -> bool {
        self.commit_ts == 0
    }
}

/// A deferred per-object action registered by a transaction.
///
/// `log` runs before the commit timestamp is drawn, `commit` applies (or with
/// `commit_ts == 0` reverts) the in-memory state, and `cleanup` is polled until
/// it reports that superseded versions have been released.
pub trait Change: Send + Sync {
    fn object_id(&self) -> ObjectId;

    /// False for objects that never reach the write-ahead log.
    fn is_logged(&self) -> bool {
        true
    }

    fn log(&self, ctx: &StoreContext, tr: &Transaction) -> Result<()>;

    fn commit(&mut self, ctx: &StoreContext, tr: &Transaction, scope: &CommitScope<'_>) -> Result<()>;

    /// Returns true once nothing is left to release.
    fn cleanup(&mut self, ctx: &StoreContext, oldest: Timestamp) -> bool;

    fn ts(&self) -> Timestamp;

    fn set_ts(&mut self, ts: Timestamp);
}

/// An in-flight transaction (or savepoint, when it has a parent).
pub struct Transaction {
    pub(crate) tid: Timestamp,
    pub(crate) ts: Timestamp,
    pub(crate) parent: Option<Box<Transaction>>,
    pub(crate) changes: Vec<Box<dyn Change>>,
    /// Rows and values this transaction will hand to the logger.
    pub(crate) log_changes: u64,
    pub(crate) trace_id: Ulid,
}

impl Transaction {
    pub(crate) fn new(tid: Timestamp, ts: Timestamp, parent: Option<Box<Transaction>>) -> Self {
        Transaction {
            tid,
            ts,
            parent,
            changes: Vec::new(),
            log_changes: 0,
            trace_id: Ulid::new(),
        }
    }

    pub fn tid(&self) -> Timestamp {
        self.tid
    }

    /// Snapshot timestamp.
    pub fn ts(&self) -> Timestamp {
        self.ts
    }

    pub fn trace_id(&self) -> Ulid {
        self.trace_id
    }

    pub fn is_savepoint(&self) -> bool {
        self.parent.is_some()
    }

    pub fn parent(&self) -> Option<&Transaction> {
        self.parent.as_deref()
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// True when `ts` is the tid of an enclosing transaction.
    pub fn is_version_of_parent(&self, ts: Timestamp) -> bool {
        let mut parent = self.parent.as_deref();
        while let Some(p) = parent {
            if p.tid == ts {
                return true;
            }
            parent = p.parent.as_deref();
        }
        false
    }

    /// Version stamped `ts` belongs to this transaction's snapshot.
    #[inline]
    pub fn valid_for_read(&self, ts: Timestamp) -> bool {
        ts == self.tid || ts < self.ts || (self.parent.is_some() && self.is_version_of_parent(ts))
    }

    /// A range deleted at `ts` that was present at `oldts` is still present for this snapshot.
    #[inline]
    pub fn old_valid_for_read(&self, ts: Timestamp, oldts: Timestamp) -> bool {
        oldts != 0 && ts != self.tid && ts > self.ts && oldts < self.ts
    }

    pub fn has_change(&self, id: ObjectId) -> bool {
        self.changes.iter().any(|c| c.object_id() == id)
    }

    /// Register `change` unless the object already has one.
    pub(crate) fn add_change(&mut self, change: Box<dyn Change>) -> bool {
        if self.has_change(change.object_id()) {
            return false;
        }
        self.changes.push(change);
        true
    }

    pub(crate) fn add_log_changes(&mut self, n: u64) {
        self.log_changes += n;
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tid", &self.tid)
            .field("ts", &self.ts)
            .field("savepoint", &self.parent.is_some())
            .field("changes", &self.changes.len())
            .field("trace_id", &self.trace_id)
            .finish()
    }
}
