#![forbid(unsafe_code)]

//! Engine counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the worker and readable from any thread.
#[derive(Debug, Default)]
pub struct EngineStats {
    faults: AtomicU64,
    duplicate_faults: AtomicU64,
    populate_calls: AtomicU64,
    chunks_installed: AtomicU64,
    chunks_evicted: AtomicU64,
    bytes_evicted: AtomicU64,
    write_backs: AtomicU64,
    objects_allocated: AtomicU64,
    objects_freed: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Fault notifications handled.
    pub faults: u64,
    /// Faults on a chunk another fault had already installed.
    pub duplicate_faults: u64,
    /// Calls made to populate callbacks.
    pub populate_calls: u64,
    /// Chunks made resident.
    pub chunks_installed: u64,
    /// Chunks discarded to stay within budget.
    pub chunks_evicted: u64,
    /// Bytes discarded to stay within budget.
    pub bytes_evicted: u64,
    /// Chunks handed to write-back hooks.
    pub write_backs: u64,
    /// Objects created.
    pub objects_allocated: u64,
    /// Objects released.
    pub objects_freed: u64,
}

impl EngineStats {
    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate_fault(&self) {
        self.duplicate_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_populate(&self) {
        self.populate_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_install(&self) {
        self.chunks_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, bytes: usize) {
        self.chunks_evicted.fetch_add(1, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write_back(&self) {
        self.write_backs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocate(&self) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self) {
        self.objects_freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter. Counters are independent, so a snapshot taken
    /// while the worker runs may mix values from adjacent events.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            faults: load(&self.faults),
            duplicate_faults: load(&self.duplicate_faults),
            populate_calls: load(&self.populate_calls),
            chunks_installed: load(&self.chunks_installed),
            chunks_evicted: load(&self.chunks_evicted),
            bytes_evicted: load(&self.bytes_evicted),
            write_backs: load(&self.write_backs),
            objects_allocated: load(&self.objects_allocated),
            objects_freed: load(&self.objects_freed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "faults={} dup={} populate={} installed={} evicted={} ({} bytes) write_backs={} objects={}/{}",
            self.faults,
            self.duplicate_faults,
            self.populate_calls,
            self.chunks_installed,
            self.chunks_evicted,
            self.bytes_evicted,
            self.write_backs,
            self.objects_allocated,
            self.objects_freed,
        )
    }
}
