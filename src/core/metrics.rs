use std::sync::atomic::{AtomicU64, Ordering};

/// Per-client operation counters.
///
/// Every logical call bumps exactly one bucket. Multi-key reads add the number of
/// keys requested to `gets`; incr/decr and lease-set count as `sets`.
#[derive(Debug, Default)]
pub struct OperationCounters {
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    others: AtomicU64,
}

/// Snapshot of the counters at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub others: u64,
}

impl CountersSnapshot {
    pub fn total(&self) -> u64 {
        self.gets + self.sets + self.deletes + self.others
    }
}

impl OperationCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_gets(&self, keys: usize) {
        self.gets.fetch_add(keys as u64, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other(&self) {
        self.others.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            others: self.others.load(Ordering::Relaxed),
        }
    }
}
