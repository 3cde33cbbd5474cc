//! Multi-producer/single-consumer ingress fanout
//!
//! A bank of [`SpscRing`]s, one per CPU group (`sched_cpus_per_queue`
//! consecutive CPUs share a bank), plus one extra fallback bank for
//! producers with no CPU affinity to target (§4.2), each guarded by a
//! short-hold [`spin::Mutex`] on the producer side only. Grounded on the
//! teacher's `kernel/src/sched/queue.rs` (`PerCpuRunQueue` bank-of-queues
//! layout) and `percpu_queue.rs`'s lock-free ring, combined the way the
//! teacher's `load_balance.rs` rotates across per-CPU queues when looking
//! for work.
//!
//! The mutex only ever protects a push; since [`SpscRing::pop`] is safe for
//! exactly one consumer regardless of how many producers contend on push,
//! the single consumer here never needs to take any bank's lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::sched::spsc::SpscRing;
use crate::task::Task;
use std::sync::Arc;

struct Bank {
    push_lock: Mutex<()>,
    ring: SpscRing,
}

/// Ingress structure shared by every CPU's worker loop and every submitter.
pub struct MpscFanout {
    banks: Vec<Bank>,
    cpus_per_bank: u32,
    cursor: AtomicUsize,
}

impl MpscFanout {
    /// `ncpu` logical CPUs, `cpus_per_bank` of which share one ring of
    /// `ring_capacity` entries (must be a power of two). One additional
    /// bank is always appended beyond the per-CPU-group banks, reserved
    /// for producers with no CPU affinity to target (`push_unbound`).
    pub fn new(ncpu: u32, cpus_per_bank: u32, ring_capacity: usize) -> Self {
        assert!(cpus_per_bank > 0, "cpus_per_bank must be nonzero");
        let ncpu_banks = ncpu.div_ceil(cpus_per_bank).max(1) as usize;
        let nbanks = ncpu_banks + 1;
        let banks = (0..nbanks)
            .map(|_| Bank {
                push_lock: Mutex::new(()),
                ring: SpscRing::new(ring_capacity),
            })
            .collect();
        Self {
            banks,
            cpus_per_bank,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Number of per-CPU-group banks, excluding the trailing fallback bank.
    fn ncpu_banks(&self) -> usize {
        self.banks.len() - 1
    }

    fn bank_for_cpu(&self, cpu: u32) -> usize {
        (cpu / self.cpus_per_bank) as usize % self.ncpu_banks()
    }

    fn fallback_bank(&self) -> usize {
        self.banks.len() - 1
    }

    /// Push onto the bank associated with `cpu`'s group. This is the
    /// primary submit path (§4.6): a single bank, no cross-bank
    /// redistribution — a full bank is the caller's cue to rescue-drain
    /// and retry the same bank.
    pub fn push_to_cpu(&self, cpu: u32, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let bank = &self.banks[self.bank_for_cpu(cpu)];
        let _guard = bank.push_lock.lock();
        bank.ring.push(task)
    }

    /// Push onto the fallback bank reserved for producers with no CPU
    /// affinity to target (§4.2).
    pub fn push_unbound(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let bank = &self.banks[self.fallback_bank()];
        let _guard = bank.push_lock.lock();
        bank.ring.push(task)
    }

    /// Push onto any bank with room, trying the caller's home bank first,
    /// then every other bank including the fallback. This is an overflow
    /// escape hatch, not the default submit path — `Scheduler::submit`
    /// targets a single bank and rescue-drains it instead, per §4.6.
    pub fn push_any(&self, preferred_cpu: u32, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let start = self.bank_for_cpu(preferred_cpu);
        let mut task = task;
        for offset in 0..self.banks.len() {
            let idx = (start + offset) % self.banks.len();
            let bank = &self.banks[idx];
            let guard = bank.push_lock.lock();
            match bank.ring.push(task) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    drop(guard);
                    task = rejected;
                }
            }
        }
        Err(task)
    }

    /// Single-consumer pop: round-robins across banks using a rotating
    /// cursor so no bank starves under sustained load, consistent with the
    /// teacher's `load_balance.rs` next-queue selection.
    pub fn pop(&self) -> Option<Arc<Task>> {
        let nbanks = self.banks.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % nbanks;
        for offset in 0..nbanks {
            let idx = (start + offset) % nbanks;
            if let Some(task) = self.banks[idx].ring.pop() {
                return Some(task);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.banks.iter().all(|b| b.ring.is_empty())
    }

    pub fn len(&self) -> usize {
        self.banks.iter().map(|b| b.ring.len()).sum()
    }

    pub fn nbanks(&self) -> usize {
        self.banks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Affinity, CreateFlags, Pid, TaskType, TypeFlags};

    fn dummy_task(label: usize) -> Arc<Task> {
        let ty = TaskType::new(
            label.to_string(),
            Pid(1),
            Some(Box::new(|_| {})),
            None,
            None,
            None,
            TypeFlags::empty(),
        )
        .unwrap();
        Task::new(ty, Vec::new(), Affinity::none(), CreateFlags::empty()).unwrap()
    }

    #[test]
    fn round_robins_across_banks() {
        let fanout = MpscFanout::new(4, 1, 16);
        for i in 0..4 {
            fanout.push_to_cpu(i, dummy_task(i as usize)).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(fanout.pop().unwrap().task_type.label.clone());
        }
        seen.sort();
        assert_eq!(seen, vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn push_any_falls_back_to_other_banks_when_home_full() {
        let fanout = MpscFanout::new(2, 1, 1);
        fanout.push_to_cpu(0, dummy_task(0)).unwrap();
        assert!(fanout.push_any(0, dummy_task(1)).is_ok());
    }

    #[test]
    fn no_loss_under_concurrent_producers() {
        use std::thread;
        let fanout = Arc::new(MpscFanout::new(4, 1, 64));
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2000;
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let fanout = fanout.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let task = dummy_task(p * PER_PRODUCER + i);
                    let mut task = task;
                    loop {
                        match fanout.push_any(p as u32, task) {
                            Ok(()) => break,
                            Err(rejected) => {
                                task = rejected;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }
        let mut received = 0usize;
        let target = PRODUCERS * PER_PRODUCER;
        while received < target {
            if fanout.pop().is_some() {
                received += 1;
            } else {
                thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(received, target);
    }
}
