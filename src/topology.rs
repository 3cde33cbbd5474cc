//! Hardware topology collaborator interface
//!
//! The spec treats CPU-count/CPU-to-NUMA-node discovery as an external
//! collaborator (§1). [`Topology`] is that interface; [`FlatTopology`] is a
//! minimal built-in implementation (every CPU its own NUMA node, or all CPUs
//! in node 0) suitable for tests and single-socket deployments. A real
//! deployment would supply its own `Topology` backed by `/sys/devices/system/
//! node` or an ACPI SRAT/SLIT walk, which is out of scope here.

/// A CPU's logical index, as handed to [`crate::scheduler::Scheduler`].
pub type CpuId = u32;

/// A NUMA node index.
pub type NumaId = u32;

/// Topology queries needed by the scheduler core.
pub trait Topology: Send + Sync {
    /// Total number of logical CPUs known to the runtime.
    fn ncpu(&self) -> u32;

    /// Total number of NUMA nodes known to the runtime.
    fn nnuma(&self) -> u32;

    /// The NUMA node a given logical CPU belongs to.
    ///
    /// Panics if `cpu >= ncpu()`; callers validate first (see
    /// [`crate::task::Affinity`] invariants).
    fn numa_of(&self, cpu: CpuId) -> NumaId;

    /// Translate a logical CPU id to the platform's "system" id, used by
    /// `CPU` affinity matching (§4.5's `task.affinity.index ==
    /// cpu.system_id`). The flat topology treats logical and system ids as
    /// identical.
    fn system_id(&self, cpu: CpuId) -> u32 {
        cpu
    }
}

/// All CPUs assigned round-robin across a fixed number of NUMA nodes.
pub struct FlatTopology {
    ncpu: u32,
    nnuma: u32,
}

impl FlatTopology {
    /// A topology with `ncpu` CPUs and a single NUMA node.
    pub fn uma(ncpu: u32) -> Self {
        Self { ncpu, nnuma: 1 }
    }

    /// A topology with `ncpu` CPUs spread evenly across `nnuma` nodes
    /// (`cpu % nnuma` determines the node).
    pub fn numa(ncpu: u32, nnuma: u32) -> Self {
        assert!(nnuma > 0 && nnuma <= ncpu, "nnuma must be in 1..=ncpu");
        Self { ncpu, nnuma }
    }
}

impl Topology for FlatTopology {
    fn ncpu(&self) -> u32 {
        self.ncpu
    }

    fn nnuma(&self) -> u32 {
        self.nnuma
    }

    fn numa_of(&self, cpu: CpuId) -> NumaId {
        assert!(cpu < self.ncpu, "cpu {cpu} out of range (ncpu={})", self.ncpu);
        cpu % self.nnuma
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uma_puts_everything_on_node_zero() {
        let topo = FlatTopology::uma(8);
        for cpu in 0..8 {
            assert_eq!(topo.numa_of(cpu), 0);
        }
    }

    #[test]
    fn numa_spreads_cpus_round_robin() {
        let topo = FlatTopology::numa(4, 2);
        assert_eq!(topo.numa_of(0), 0);
        assert_eq!(topo.numa_of(1), 1);
        assert_eq!(topo.numa_of(2), 0);
        assert_eq!(topo.numa_of(3), 1);
    }
}
