#![allow(dead_code)]

use std::ops::Range;
use std::sync::Arc;

use flintdelta::{Claim, ColumnDef, MemoryLogger, RowId, StoreConfig, StoreContext, Table, Transaction, Value};

/// A store recording its log in memory, with one table `t` holding column `c`.
pub struct Fixture {
    pub ctx: StoreContext,
    pub logger: Arc<MemoryLogger>,
    pub table: Arc<Table>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        let logger = Arc::new(MemoryLogger::new());
        let ctx = StoreContext::new(config, logger.clone()).expect("failed to create store");
        let table = Table::create(&ctx, "t", &[ColumnDef::new("c")]).expect("failed to create table");
        Fixture { ctx, logger, table }
    }

    /// Insert `values` into `c` and commit.
    pub fn load(&self, values: Vec<Value>) -> Claim {
        let mut tr = self.ctx.begin();
        let claim = self.insert(&mut tr, values);
        self.ctx.commit(tr).expect("load commit failed");
        claim
    }

    /// Insert `values` into `c` without committing.
    pub fn insert(&self, tr: &mut Transaction, values: Vec<Value>) -> Claim {
        let claim = self
            .table
            .claim(&self.ctx, tr, values.len() as u64)
            .expect("claim failed");
        self.table
            .append(&self.ctx, tr, "c", &claim, &values)
            .expect("append failed");
        claim
    }

    pub fn scan(&self, tr: &Transaction) -> Vec<(RowId, Value)> {
        self.table.scan(&self.ctx, tr, "c").expect("scan failed")
    }

    pub fn value_at(&self, tr: &Transaction, rid: RowId) -> Option<Value> {
        self.scan(tr).into_iter().find(|(r, _)| *r == rid).map(|(_, v)| v)
    }
}

pub fn ints(range: Range<i64>) -> Vec<Value> {
    range.map(Value::Int).collect()
}
