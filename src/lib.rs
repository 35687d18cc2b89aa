//! Multi-version columnar delta storage.
//!
//! Tables keep row visibility in a chain of timestamped segments and column
//! values in per-column delta chains. Transactions come from a shared
//! [`StoreContext`]; their changes are logged, committed, rolled back and
//! garbage collected through the change list.

pub mod config;
pub mod error;
pub mod gc;
pub mod logging;
pub mod storage;
pub mod store;
pub mod transaction;
pub mod types;
pub mod wal;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use gc::{GcStats, GcWorker};
pub use storage::{AccessMode, Claim, ColumnDef, CountMode, DeleteCount, Persistence, StorageKind, Table};
pub use store::StoreContext;
pub use transaction::Transaction;
pub use types::{RowId, RowSet, Timestamp, Value};
pub use wal::{LogRecord, Logger, MemoryLogger, NullLogger, WalLogger};
