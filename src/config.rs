//! Runtime configuration
//!
//! A plain, programmatic configuration surface: this module only defines the
//! typed values and validates them. Reading `sched_cpus_per_queue` out of an
//! environment variable or a config file is an external collaborator's job,
//! not this crate's.

use crate::error::{Result, RuntimeError};
use crate::task::{Affinity, AffinityKind};

/// Default scheduling quantum: 20ms, per the spec's design default.
pub const DEFAULT_QUANTUM_NS: u64 = 20_000_000;

/// Default ingress ring capacity, per sub-bank.
pub const DEFAULT_IN_QUEUE_SIZE: usize = 256;

/// Upper bound on inline task metadata.
pub const MAX_METADATA_SIZE: usize = 4096;

/// Typed runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of CPUs that share a single MPSC ingress sub-queue.
    pub sched_cpus_per_queue: u32,
    /// Whether a worker caches an `IMMEDIATE` successor in a single slot.
    pub sched_immediate_successor: bool,
    /// Capacity of each MPSC ingress sub-queue (and its fallback bank).
    pub sched_in_queue_size: usize,
    /// Default affinity applied to tasks created without an explicit one.
    pub affinity_default: Affinity,
    /// Default affinity strictness.
    pub affinity_default_policy: AffinityKind,
    /// Round-robin quantum between client processes, in nanoseconds.
    pub quantum_ns: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sched_cpus_per_queue: 1,
            sched_immediate_successor: true,
            sched_in_queue_size: DEFAULT_IN_QUEUE_SIZE,
            affinity_default: Affinity::none(),
            affinity_default_policy: AffinityKind::Preferred,
            quantum_ns: DEFAULT_QUANTUM_NS,
        }
    }
}

impl RuntimeConfig {
    /// Validate range/consistency constraints, returning a typed error
    /// instead of panicking on a bad value.
    pub fn validate(&self) -> Result<()> {
        if self.sched_cpus_per_queue == 0 {
            return Err(RuntimeError::InvalidParameter {
                name: "sched_cpus_per_queue",
            });
        }
        if self.sched_in_queue_size == 0 || !self.sched_in_queue_size.is_power_of_two() {
            return Err(RuntimeError::InvalidParameter {
                name: "sched_in_queue_size",
            });
        }
        if self.quantum_ns == 0 {
            return Err(RuntimeError::InvalidParameter { name: "quantum_ns" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_queue_size() {
        let mut cfg = RuntimeConfig::default();
        cfg.sched_in_queue_size = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_quantum() {
        let mut cfg = RuntimeConfig::default();
        cfg.quantum_ns = 0;
        assert!(cfg.validate().is_err());
    }
}
