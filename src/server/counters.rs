use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::time::{Clock, Millis};

/// Plain copy of the counter fields at one moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterValues {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub last_time: Millis,
}

/// Transaction counters shared between the request handlers and the
/// activity generator.
///
/// `total` is not stored; it is always `success + failed` of the same read.
/// Increments share the gate and run concurrently, `reset` takes it
/// exclusively so it never lands between the steps of an increment.
pub struct CounterStore {
    gate: RwLock<()>,
    success: AtomicU64,
    failed: AtomicU64,
    last_time: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl CounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            gate: RwLock::new(()),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_time: AtomicU64::new(0),
            clock,
        }
    }

    pub fn increment(&self, success: bool) {
        let _shared = self.gate.read().unwrap_or_else(|p| p.into_inner());
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.last_time.fetch_max(self.clock.now_ms(), Ordering::Relaxed);
    }

    pub fn snapshot_counters(&self) -> CounterValues {
        let _shared = self.gate.read().unwrap_or_else(|p| p.into_inner());
        let success = self.success.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        CounterValues {
            total: success + failed,
            success,
            failed,
            last_time: self.last_time.load(Ordering::Relaxed),
        }
    }

    /// Authorization is the caller's job.
    pub fn reset(&self) {
        let _exclusive = self.gate.write().unwrap_or_else(|p| p.into_inner());
        self.success.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.last_time.store(0, Ordering::Relaxed);
    }
}
