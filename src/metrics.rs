//! Scheduler counters
//!
//! Plain atomic counters, grounded on the teacher's per-subsystem metrics
//! modules (`kernel/src/sched/metrics.rs`, `kernel/src/perf/`). Exporting
//! these to an external collector (Prometheus, a tracing span, ...) is
//! out of scope; the counters themselves are in-scope ambient state that
//! `process_sched.rs`'s work-stealing and yield-pop branches record into
//! and that tests assert against directly.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters tracking scheduler activity.
#[derive(Default)]
pub struct Metrics {
    /// Total tasks popped from an MPSC ingress and classified (§4.4).
    served_tasks: AtomicU64,
    /// Number of times `submit` fell back to draining the ingress via the
    /// DTLock because the lock-free push failed (§4.6).
    rescue_drains: AtomicU64,
    /// Number of tasks returned via the work-stealing pass (§4.5 step e).
    steals: AtomicU64,
    /// Number of yield-list entries popped past their trigger expiry.
    yields_expired: AtomicU64,
    /// Number of yield-list entries popped via the fallback (no-other-work)
    /// pass that ignores the trigger.
    yields_fallback: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_served(&self) {
        self.served_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rescue_drain(&self) {
        self.rescue_drains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_yield_expired(&self) {
        self.yields_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_yield_fallback(&self) {
        self.yields_fallback.fetch_add(1, Ordering::Relaxed);
    }

    pub fn served_tasks(&self) -> u64 {
        self.served_tasks.load(Ordering::Relaxed)
    }

    pub fn rescue_drains(&self) -> u64 {
        self.rescue_drains.load(Ordering::Relaxed)
    }

    pub fn steals(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }

    pub fn yields_expired(&self) -> u64 {
        self.yields_expired.load(Ordering::Relaxed)
    }

    pub fn yields_fallback(&self) -> u64 {
        self.yields_fallback.load(Ordering::Relaxed)
    }
}
