use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Tunables for a [`StoreContext`](crate::store::StoreContext).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of table-level lock stripes (power of two).
    pub table_lock_stripes: usize,
    /// Number of column-level lock stripes (power of two).
    pub column_lock_stripes: usize,
    /// Dictionary size at which 8-bit codes widen to 16 bits.
    pub dictionary_small_limit: usize,
    /// Dictionary size past which a column is decompressed.
    pub dictionary_large_limit: usize,
    /// Rewritten rows (updates plus reused slots) before vacuum rewrites a column.
    pub vacuum_threshold: usize,
    /// Idle garbage-collection interval for [`GcWorker`](crate::gc::GcWorker).
    pub gc_interval: Duration,
    /// Optional write-ahead log file.
    pub wal_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            table_lock_stripes: 64,
            column_lock_stripes: 64,
            dictionary_small_limit: 256,
            dictionary_large_limit: 65536,
            vacuum_threshold: 1024,
            gc_interval: Duration::from_millis(1000),
            wal_path: None,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `FLINTDELTA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = StoreConfig::default();
        if let Some(n) = env_usize("FLINTDELTA_TABLE_LOCKS")? {
            config.table_lock_stripes = n;
        }
        if let Some(n) = env_usize("FLINTDELTA_COLUMN_LOCKS")? {
            config.column_lock_stripes = n;
        }
        if let Some(n) = env_usize("FLINTDELTA_VACUUM_THRESHOLD")? {
            config.vacuum_threshold = n;
        }
        if let Some(ms) = env_usize("FLINTDELTA_GC_INTERVAL_MS")? {
            config.gc_interval = Duration::from_millis(ms as u64);
        }
        if let Ok(path) = std::env::var("FLINTDELTA_WAL") {
            config.wal_path = Some(PathBuf::from(path));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.table_lock_stripes.is_power_of_two() {
            return Err(Error::InvalidOperation(format!(
                "table lock stripes must be a power of two, got {}",
                self.table_lock_stripes
            )));
        }
        if !self.column_lock_stripes.is_power_of_two() {
            return Err(Error::InvalidOperation(format!(
                "column lock stripes must be a power of two, got {}",
                self.column_lock_stripes
            )));
        }
        if self.dictionary_small_limit == 0
            || self.dictionary_small_limit > 256
            || self.dictionary_large_limit < self.dictionary_small_limit
            || self.dictionary_large_limit > 65536
        {
            return Err(Error::InvalidOperation(format!(
                "invalid dictionary tiers {}/{}",
                self.dictionary_small_limit, self.dictionary_large_limit
            )));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::InvalidOperation(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
