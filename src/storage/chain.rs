use std::sync::Arc;

use parking_lot::RwLock;

use crate::transaction::Transaction;
use crate::types::Timestamp;

/// A node in a newest-first version list.
pub trait Versioned: Send + Sync {
    fn version_ts(&self) -> Timestamp;

    fn next_version(&self) -> Option<Arc<Self>>;

    fn set_next_version(&self, next: Option<Arc<Self>>);
}

/// Head cell of a version list.
///
/// Installing a new head is a compare-and-swap against the head the writer
/// started from; whoever loses the swap did not become the object's writer.
pub struct VersionChain<T: Versioned> {
    head: RwLock<Arc<T>>,
}

impl<T: Versioned> VersionChain<T> {
    pub fn new(initial: T) -> Self {
        VersionChain {
            head: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn head(&self) -> Arc<T> {
        self.head.read().clone()
    }

    pub fn is_head(&self, node: &Arc<T>) -> bool {
        Arc::ptr_eq(&*self.head.read(), node)
    }

    /// Swap in `new` if the head is still `expected`.
    pub fn compare_and_swap(&self, expected: &Arc<T>, new: Arc<T>) -> bool {
        let mut head = self.head.write();
        if !Arc::ptr_eq(&*head, expected) {
            return false;
        }
        *head = new;
        true
    }

    pub(crate) fn replace_head(&self, new: Arc<T>) {
        *self.head.write() = new;
    }

    /// Newest version `tr` may read; the oldest one when none qualifies.
    pub fn visible(&self, tr: &Transaction) -> Arc<T> {
        visible_from(self.head(), tr)
    }

    /// Drop `node` from the list, linking its successor in its place.
    pub fn unlink(&self, node: &Arc<T>) -> bool {
        let next = node.next_version();
        {
            let mut head = self.head.write();
            if Arc::ptr_eq(&*head, node) {
                match next {
                    Some(next) => *head = next,
                    // the base version is never unlinked
                    None => return false,
                }
                node.set_next_version(None);
                return true;
            }
        }
        let mut cur = self.head();
        while let Some(n) = cur.next_version() {
            if Arc::ptr_eq(&n, node) {
                cur.set_next_version(next);
                node.set_next_version(None);
                return true;
            }
            cur = n;
        }
        false
    }

    /// Number of versions, head included.
    pub fn depth(&self) -> usize {
        let mut n = 1;
        let mut cur = self.head();
        while let Some(next) = cur.next_version() {
            n += 1;
            cur = next;
        }
        n
    }
}

/// Walk from `node` to the first version valid for `tr`.
pub fn visible_from<T: Versioned>(mut node: Arc<T>, tr: &Transaction) -> Arc<T> {
    while !tr.valid_for_read(node.version_ts()) {
        match node.next_version() {
            Some(next) => node = next,
            None => break,
        }
    }
    node
}
