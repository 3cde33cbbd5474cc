//! Scheduler core: concurrency substrate plus scheduling logic.
//!
//! Module layout mirrors the dependency order from the overview table:
//! SPSC ring → MPSC fanout → delegation lock → process-local scheduler →
//! global scheduler → worker protocol.

pub mod dtlock;
pub mod mpsc;
pub mod process_sched;
pub mod scheduler;
pub mod spsc;
pub mod worker;
