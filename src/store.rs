use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, info_span, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::gc::GcStats;
use crate::storage::array::DictionaryTiers;
use crate::transaction::{Change, CommitScope, Transaction};
use crate::types::{ObjectId, TRANSACTION_ID_BASE, Timestamp};
use crate::wal::{Logger, NullLogger, WalLogger};

/// Fixed array of mutexes indexed by object id.
pub struct LockStripes {
    locks: Vec<Mutex<()>>,
    mask: usize,
}

impl LockStripes {
    pub fn new(n: usize) -> Self {
        let n = n.max(1).next_power_of_two();
        LockStripes {
            locks: (0..n).map(|_| Mutex::new(())).collect(),
            mask: n - 1,
        }
    }

    pub fn lock(&self, id: ObjectId) -> MutexGuard<'_, ()> {
        self.locks[(id as usize) & self.mask].lock()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

struct StoreState {
    /// `(tid, ts)` of running top-level transactions, in begin order.
    active: Vec<(Timestamp, Timestamp)>,
    /// Finished changes still holding superseded versions.
    pending: Vec<Box<dyn Change>>,
}

/// Shared state of one storage instance: clocks, the active-transaction
/// registry, lock stripes and the logger.
pub struct StoreContext {
    config: StoreConfig,
    tiers: DictionaryTiers,
    logger: Arc<dyn Logger>,
    timestamp: AtomicU64,
    transaction_id: AtomicU64,
    object_id: AtomicU64,
    oldest: AtomicU64,
    state: Mutex<StoreState>,
    commit_lock: Mutex<()>,
    table_locks: LockStripes,
    column_locks: LockStripes,
    retired_segments: AtomicU64,
}

impl StoreContext {
    pub fn new(config: StoreConfig, logger: Arc<dyn Logger>) -> Result<Self> {
        config.validate()?;
        Ok(StoreContext {
            tiers: DictionaryTiers::from(&config),
            table_locks: LockStripes::new(config.table_lock_stripes),
            column_locks: LockStripes::new(config.column_lock_stripes),
            config,
            logger,
            timestamp: AtomicU64::new(1),
            transaction_id: AtomicU64::new(TRANSACTION_ID_BASE),
            object_id: AtomicU64::new(1),
            oldest: AtomicU64::new(1),
            state: Mutex::new(StoreState {
                active: Vec::new(),
                pending: Vec::new(),
            }),
            commit_lock: Mutex::new(()),
            retired_segments: AtomicU64::new(0),
        })
    }

    /// Store with the logger the configuration asks for.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let logger: Arc<dyn Logger> = match &config.wal_path {
            Some(path) => Arc::new(WalLogger::open(path)?),
            None => Arc::new(NullLogger),
        };
        StoreContext::new(config, logger)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn tiers(&self) -> DictionaryTiers {
        self.tiers
    }

    pub fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }

    /// Current value of the timestamp counter.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp.load(Ordering::Acquire)
    }

    fn next_timestamp(&self) -> Timestamp {
        self.timestamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Oldest snapshot any running transaction may read.
    pub fn oldest(&self) -> Timestamp {
        self.oldest.load(Ordering::Acquire)
    }

    pub fn next_object_id(&self) -> ObjectId {
        self.object_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn lock_table(&self, id: ObjectId) -> MutexGuard<'_, ()> {
        self.table_locks.lock(id)
    }

    pub fn lock_column(&self, id: ObjectId) -> MutexGuard<'_, ()> {
        self.column_locks.lock(id)
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn retired_segments(&self) -> u64 {
        self.retired_segments.load(Ordering::Relaxed)
    }

    pub(crate) fn park_retired(&self, n: usize) {
        self.retired_segments.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn release_retired(&self, n: usize) {
        self.retired_segments.fetch_sub(n as u64, Ordering::Relaxed);
    }

    pub fn begin(&self) -> Transaction {
        let mut state = self.state.lock();
        let ts = self.next_timestamp();
        let tid = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        state.active.push((tid, ts));
        self.update_oldest(&state);
        let tr = Transaction::new(tid, ts, None);
        debug!(trace_id = %tr.trace_id, tid, ts, "begin");
        tr
    }

    /// Nested transaction reading the parent's snapshot plus its changes.
    pub fn savepoint(&self, parent: Transaction) -> Transaction {
        let tid = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        let ts = parent.ts;
        let child = Transaction::new(tid, ts, Some(Box::new(parent)));
        debug!(trace_id = %child.trace_id, tid, ts, "savepoint");
        child
    }

    fn update_oldest(&self, state: &StoreState) {
        let oldest = state
            .active
            .iter()
            .map(|(_, ts)| *ts)
            .min()
            .unwrap_or_else(|| self.timestamp());
        self.oldest.store(oldest, Ordering::Release);
    }

    fn others(state: &StoreState, tid: Timestamp) -> Vec<Timestamp> {
        state
            .active
            .iter()
            .filter(|(t, _)| *t != tid)
            .map(|(_, ts)| *ts)
            .collect()
    }

    fn end(&self, state: &mut StoreState, tr: &Transaction) {
        state.active.retain(|(tid, _)| *tid != tr.tid);
        self.update_oldest(state);
        if state.active.is_empty() && !state.pending.is_empty() {
            let oldest = self.timestamp() + 1;
            self.sweep(state, oldest);
        }
    }

    fn sweep(&self, state: &mut StoreState, oldest: Timestamp) -> usize {
        let before = state.pending.len();
        state.pending.retain_mut(|change| !change.cleanup(self, oldest));
        before - state.pending.len()
    }

    fn log_changes(&self, tr: &Transaction, changes: &[Box<dyn Change>]) -> Result<()> {
        self.logger.transaction_start(tr.tid)?;
        for change in changes.iter().filter(|c| c.is_logged()) {
            change.log(self, tr)?;
        }
        self.logger.transaction_end(tr.tid)
    }

    /// Make `tr`'s changes durable and visible, then end it.
    ///
    /// Committing a savepoint releases it into its parent and commits that.
    pub fn commit(&self, mut tr: Transaction) -> Result<()> {
        if tr.is_savepoint() {
            let parent = self.release_savepoint(tr)?;
            return self.commit(parent);
        }
        let span = info_span!("commit", trace_id = %tr.trace_id, tid = tr.tid);
        let _enter = span.enter();

        let mut changes = std::mem::take(&mut tr.changes);
        if changes.is_empty() {
            let mut state = self.state.lock();
            self.end(&mut state, &tr);
            debug!("read-only commit");
            return Ok(());
        }

        let commit_guard = self.commit_lock.lock();
        let logged = changes.iter().any(|c| c.is_logged());
        if logged && let Err(e) = self.log_changes(&tr, &changes) {
            drop(commit_guard);
            debug!(error = %e, "logging failed, rolling back");
            tr.changes = changes;
            self.rollback(tr)?;
            return Err(e);
        }

        let mut state = self.state.lock();
        let commit_ts = self.next_timestamp();
        let active = Self::others(&state, tr.tid);
        let oldest = active.iter().copied().min().unwrap_or(commit_ts);
        let scope = CommitScope {
            commit_ts,
            oldest,
            active: &active,
        };
        self.sweep(&mut state, oldest);

        // every change is stamped even when one fails, so nothing stays owned by `tr`
        let mut result = Ok(());
        for change in changes.iter_mut() {
            if let Err(e) = change.commit(self, &tr, &scope) {
                warn!(object_id = change.object_id(), error = %e, "commit callback failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            change.set_ts(commit_ts);
        }
        for mut change in changes {
            if !change.cleanup(self, oldest) {
                state.pending.push(change);
            }
        }
        self.end(&mut state, &tr);
        drop(state);
        drop(commit_guard);

        if logged {
            self.logger.flush(commit_ts)?;
        }
        info!(commit_ts, oldest, changes = tr.log_changes, "committed");
        result
    }

    /// Undo everything `tr` did and end it.
    pub fn rollback(&self, mut tr: Transaction) -> Result<()> {
        if tr.is_savepoint() {
            let parent = self.rollback_savepoint(tr)?;
            return self.rollback(parent);
        }
        let span = info_span!("rollback", trace_id = %tr.trace_id, tid = tr.tid);
        let _enter = span.enter();

        let mut changes = std::mem::take(&mut tr.changes);
        changes.reverse();

        let mut state = self.state.lock();
        let active = Self::others(&state, tr.tid);
        let oldest = active.iter().copied().min().unwrap_or(tr.ts);
        let scope = CommitScope {
            commit_ts: 0,
            oldest,
            active: &active,
        };
        let result = self.revert(&tr, &mut changes, &scope);
        self.sweep(&mut state, oldest);
        for mut change in changes {
            if !change.cleanup(self, oldest) {
                state.pending.push(change);
            }
        }
        self.end(&mut state, &tr);
        debug!("rolled back");
        result
    }

    fn revert(&self, tr: &Transaction, changes: &mut [Box<dyn Change>], scope: &CommitScope<'_>) -> Result<()> {
        let mut result = Ok(());
        for change in changes.iter_mut() {
            if let Err(e) = change.commit(self, tr, scope) {
                warn!(object_id = change.object_id(), error = %e, "rollback callback failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
            change.set_ts(self.timestamp());
        }
        result
    }

    /// Fold a savepoint into its parent and hand the parent back.
    ///
    /// A top-level transaction passed here is rolled back and rejected.
    pub fn release_savepoint(&self, mut child: Transaction) -> Result<Transaction> {
        let Some(parent_tid) = child.parent.as_ref().map(|p| p.tid) else {
            return Err(self.reject_top_level(child));
        };
        let mut changes = std::mem::take(&mut child.changes);
        let scope = CommitScope {
            commit_ts: parent_tid,
            oldest: parent_tid,
            active: &[],
        };
        let mut failure = None;
        for change in changes.iter_mut() {
            if let Err(e) = change.commit(self, &child, &scope) {
                failure = Some(e);
                break;
            }
            change.set_ts(parent_tid);
        }
        let mut parent = child
            .parent
            .take()
            .ok_or_else(|| Error::internal("savepoint lost its parent"))?;
        for mut change in changes {
            if !change.cleanup(self, parent_tid) && !parent.has_change(change.object_id()) {
                parent.changes.push(change);
            }
        }
        parent.log_changes += child.log_changes;
        if let Some(e) = failure {
            warn!(error = %e, "savepoint release failed, rolling back");
            self.rollback(*parent)?;
            return Err(e);
        }
        debug!(tid = child.tid, parent = parent_tid, "savepoint released");
        Ok(*parent)
    }

    /// Undo a savepoint's changes and hand the parent back.
    ///
    /// A top-level transaction passed here is rolled back and rejected.
    pub fn rollback_savepoint(&self, mut child: Transaction) -> Result<Transaction> {
        if !child.is_savepoint() {
            return Err(self.reject_top_level(child));
        }
        let mut changes = std::mem::take(&mut child.changes);
        changes.reverse();

        let mut state = self.state.lock();
        let active: Vec<Timestamp> = state.active.iter().map(|(_, ts)| *ts).collect();
        let oldest = self.oldest();
        let scope = CommitScope {
            commit_ts: 0,
            oldest,
            active: &active,
        };
        let result = self.revert(&child, &mut changes, &scope);
        for mut change in changes {
            if !change.cleanup(self, oldest) {
                state.pending.push(change);
            }
        }
        drop(state);
        let parent = child
            .parent
            .take()
            .ok_or_else(|| Error::internal("savepoint lost its parent"))?;
        debug!(tid = child.tid, "savepoint rolled back");
        result.map(|_| *parent)
    }

    fn reject_top_level(&self, tr: Transaction) -> Error {
        let tid = tr.tid;
        warn!(tid, "savepoint operation on a top-level transaction");
        match self.rollback(tr) {
            Ok(()) => Error::InvalidOperation(format!("transaction {} is not a savepoint", tid)),
            Err(e) => e,
        }
    }

    /// Release superseded versions nobody can read any more.
    pub fn collect_garbage(&self) -> GcStats {
        let mut state = self.state.lock();
        let oldest = if state.active.is_empty() {
            self.timestamp() + 1
        } else {
            self.oldest()
        };
        let released = self.sweep(&mut state, oldest);
        GcStats {
            oldest,
            released,
            pending: state.pending.len(),
            retired_segments: self.retired_segments(),
        }
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("timestamp", &self.timestamp())
            .field("oldest", &self.oldest())
            .field("table_locks", &self.table_locks.len())
            .field("column_locks", &self.column_locks.len())
            .finish()
    }
}
