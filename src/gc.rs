use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::StoreContext;
use crate::types::Timestamp;

/// Outcome of one sweep over the pending change list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Watermark the sweep ran with.
    pub oldest: Timestamp,
    /// Changes whose superseded versions were released.
    pub released: usize,
    /// Changes still waiting for older snapshots to finish.
    pub pending: usize,
    /// Merged-away segments still parked.
    pub retired_segments: u64,
}

/// Cumulative counters over all sweeps.
#[derive(Debug, Default)]
pub struct GcCounters {
    pub sweeps: AtomicU64,
    pub released: AtomicU64,
}

impl GcCounters {
    pub fn record(&self, stats: &GcStats) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.released.fetch_add(stats.released as u64, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    fn signal(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep up to `timeout`; true once shutdown was signalled.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// Background thread running [`StoreContext::collect_garbage`] periodically.
pub struct GcWorker {
    shutdown: Arc<Shutdown>,
    handle: Option<JoinHandle<()>>,
    counters: Arc<GcCounters>,
}

impl GcWorker {
    pub fn spawn(ctx: Arc<StoreContext>, interval: Duration) -> Result<Self> {
        let shutdown = Arc::new(Shutdown::default());
        let counters = Arc::new(GcCounters::default());
        let (signal, totals) = (shutdown.clone(), counters.clone());

        let handle = std::thread::Builder::new()
            .name("flintdelta-gc".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "gc worker started");
                while !signal.wait_timeout(interval) {
                    let stats = ctx.collect_garbage();
                    totals.record(&stats);
                    if stats.released > 0 {
                        debug!(
                            oldest = stats.oldest,
                            released = stats.released,
                            pending = stats.pending,
                            "gc sweep"
                        );
                    }
                }
                info!("gc worker stopped");
            })?;

        Ok(GcWorker {
            shutdown,
            handle: Some(handle),
            counters,
        })
    }

    pub fn counters(&self) -> &GcCounters {
        &self.counters
    }

    /// Signal the worker and wait for it to exit.
    pub fn stop(&mut self) {
        self.shutdown.signal();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
