use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use bincode::{Decode, Encode};
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Commit timestamp, or a transaction id when `>= TRANSACTION_ID_BASE`.
pub type Timestamp = u64;
/// Physical row position within a table.
pub type RowId = u64;
/// Table or column identifier; also the lock-stripe key.
pub type ObjectId = u64;

/// First id handed to in-flight transactions. Everything below is a commit timestamp.
pub const TRANSACTION_ID_BASE: Timestamp = 1 << 63;

/// Returns true when `ts` names an uncommitted transaction rather than a commit.
#[inline]
pub fn is_transaction_id(ts: Timestamp) -> bool {
    ts >= TRANSACTION_ID_BASE
}

/// A single column value
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
        }
    }
}

// Floats compare by bit pattern / total order so values can key dictionaries.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Int(n) => n.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bool(b) => b.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Row positions handed to delete and update.
#[derive(Debug, Clone)]
pub enum RowSet {
    /// Dense run `[start, start + count)`.
    Range { start: RowId, count: u64 },
    /// Sorted candidate bitmap.
    Candidates(RoaringTreemap),
    /// Arbitrary ids, possibly unsorted.
    Ids(Vec<RowId>),
}

impl RowSet {
    pub fn range(start: RowId, count: u64) -> Self {
        RowSet::Range { start, count }
    }

    pub fn len(&self) -> u64 {
        match self {
            RowSet::Range { count, .. } => *count,
            RowSet::Candidates(bm) => bm.len(),
            RowSet::Ids(ids) => ids.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in input order.
    pub fn to_vec(&self) -> Result<Vec<RowId>> {
        match self {
            RowSet::Range { start, count } => Ok((*start..run_end(*start, *count)?).collect()),
            RowSet::Candidates(bm) => Ok(bm.iter().collect()),
            RowSet::Ids(ids) => Ok(ids.clone()),
        }
    }

    /// Consecutive ids coalesced into `(start, len)` runs, ascending.
    pub fn runs(&self) -> Result<Vec<(RowId, u64)>> {
        let runs = match self {
            RowSet::Range { start, count } => {
                if *count == 0 {
                    Vec::new()
                } else {
                    vec![(*start, *count)]
                }
            }
            RowSet::Candidates(bm) => coalesce(bm.iter()),
            RowSet::Ids(ids) => {
                let mut sorted = ids.clone();
                sorted.sort_unstable();
                sorted.dedup();
                coalesce(sorted.into_iter())
            }
        };
        for &(start, len) in &runs {
            run_end(start, len)?;
        }
        Ok(runs)
    }
}

fn run_end(start: RowId, count: u64) -> Result<RowId> {
    start
        .checked_add(count)
        .ok_or_else(|| Error::InvalidOperation(format!("rows {}+{} overflow the row id space", start, count)))
}

fn coalesce(ids: impl Iterator<Item = RowId>) -> Vec<(RowId, u64)> {
    let mut runs: Vec<(RowId, u64)> = Vec::new();
    for id in ids {
        match runs.last_mut() {
            Some((start, len)) if *start + *len == id => *len += 1,
            _ => runs.push((id, 1)),
        }
    }
    runs
}
