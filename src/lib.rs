//! A cooperative, delegation-locked task scheduler for shared-memory
//! multi-core/NUMA systems.
//!
//! This crate schedules caller-supplied work (`Task`s) across a fixed set
//! of pinned worker threads with no task migration once assigned, using a
//! delegation lock (`sched::dtlock`) to keep scheduler-state mutation
//! single-threaded without blocking. See `README`/`SPEC_FULL.md` in the
//! repository for the full design write-up; this module is the public
//! surface a caller embeds.

pub mod config;
pub mod error;
pub mod metrics;
pub mod sched;
pub mod task;
pub mod topology;

use std::sync::Arc;
use std::thread::JoinHandle;

pub use config::RuntimeConfig;
pub use error::{ErrorCode, Result, RuntimeError};
pub use metrics::Metrics;
pub use sched::scheduler::Scheduler;
pub use task::{
    Affinity, AffinityKind, CompletedCallback, CostFn, CreateFlags, EndCallback, Pid, RunCallback,
    SubmitFlags, Task, TaskHandle, TaskType, TypeFlags,
};
pub use topology::{CpuId, FlatTopology, NumaId, Topology};

/// Owns the scheduler core plus the pinned worker threads that drive it.
///
/// This is the crate's top-level embedding point: construct one `Runtime`
/// per process, `type_init`/`create`/`submit` tasks onto it, and call
/// `shutdown` (or drop it, which calls `shutdown` implicitly) when done.
pub struct Runtime {
    scheduler: Arc<Scheduler>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Brings up one pinned worker thread per CPU in `topology`.
    pub fn start(topology: Arc<dyn Topology>, config: RuntimeConfig) -> Result<Self> {
        let scheduler = Arc::new(Scheduler::new(topology, config)?);
        let ncpu = scheduler.ncpu();
        let workers = (0..ncpu)
            .map(|cpu| sched::worker::Worker::spawn(cpu, scheduler.clone()))
            .collect();
        Ok(Self { scheduler, workers })
    }

    /// The scheduler core, for callers that need direct `submit`/metrics
    /// access rather than going through `Worker`'s task-body operations.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// `type_init`: register a task type.
    pub fn type_init(
        &self,
        label: impl Into<String>,
        owning_pid: Pid,
        run_callback: Option<RunCallback>,
        end_callback: Option<EndCallback>,
        completed_callback: Option<CompletedCallback>,
        get_cost: Option<CostFn>,
        flags: TypeFlags,
    ) -> Result<Arc<TaskType>> {
        TaskType::new(
            label,
            owning_pid,
            run_callback,
            end_callback,
            completed_callback,
            get_cost,
            flags,
        )
    }

    /// `create`: allocate a task of `task_type`, ready for `submit`. The
    /// task's initial affinity is the runtime's configured default
    /// (`affinity_default`'s level/index, with `affinity_default_policy` as
    /// its strictness); change it afterward with `set_task_affinity`.
    pub fn create(
        &self,
        task_type: Arc<TaskType>,
        metadata: Vec<u8>,
        flags: CreateFlags,
    ) -> Result<Arc<Task>> {
        let config = self.scheduler.config();
        let mut affinity = config.affinity_default;
        affinity.kind = config.affinity_default_policy;
        Task::new(task_type, metadata, affinity, flags)
    }

    /// `submit`: hand a task to the scheduler. Valid from any thread,
    /// including outside a worker (in which case `flags` must not request
    /// `INLINE`, `BLOCKING` or an immediate-successor slot, all of which
    /// require a worker context — see `sched::worker::submit_with_flags`).
    pub fn submit(&self, task: Arc<Task>, flags: SubmitFlags, current_cpu: CpuId) -> Result<()> {
        if !flags.is_valid() {
            return Err(RuntimeError::InvalidOperation {
                reason: "submit flags are mutually exclusive",
            });
        }
        if sched::worker::current_task().is_some() {
            return sched::worker::submit_with_flags(task, flags);
        }
        if flags.intersects(SubmitFlags::INLINE | SubmitFlags::IMMEDIATE | SubmitFlags::BLOCKING) {
            return Err(RuntimeError::OutsideTask);
        }
        task.set_unlocked(flags.contains(SubmitFlags::UNLOCKED));
        if flags.contains(SubmitFlags::DEADLINE_WAKE) {
            if task.is_parallel() {
                return Err(error::SubmitError::ParallelDeadlineWake.into());
            }
            // Flips the existing heap entry's state in place; this is not
            // a new submission, so it must not re-enter the ingress/gate
            // path below (that would duplicate the heap entry and spuriously
            // decrement `blocking_count` a second time).
            task.deadline_wake();
            return Ok(());
        }
        if sched::worker::gate_for_submit(&task) {
            self.scheduler.submit(task, current_cpu);
        }
        Ok(())
    }

    /// `pause`: block the calling task until woken by a matching submit.
    /// Only valid from within a task body.
    pub fn pause(&self) -> Result<()> {
        sched::worker::pause()
    }

    /// `yield_now`: give up the worker's claim on the CPU so other ready
    /// work can run, re-queuing this task.
    pub fn yield_now(&self) -> Result<()> {
        sched::worker::yield_now()
    }

    /// `schedpoint`: cooperative preemption check; a no-op unless this
    /// task has run past the configured quantum.
    pub fn schedpoint(&self) -> Result<()> {
        sched::worker::schedpoint()
    }

    /// `waitfor`: deadline sleep, returning elapsed nanoseconds.
    pub fn waitfor(&self, ns: u64) -> Result<u64> {
        sched::worker::waitfor(ns)
    }

    /// `flush`: explicitly drain the calling task's accumulated submit
    /// window instead of waiting for the next implicit flush point.
    pub fn flush(&self) -> Result<()> {
        sched::worker::flush()
    }

    /// `destroy`: cancel a task's remaining unscheduled replicas.
    /// Already-dispatched replicas still run to completion.
    pub fn destroy(&self, task: &Arc<Task>) {
        task.cancel();
    }

    /// `attach`: adopt the calling thread as a worker for `cpu`, running
    /// an implicit external task.
    pub fn attach(&self, cpu: CpuId, affinity: Affinity, label: &str) -> Arc<Task> {
        sched::worker::attach(cpu, self.scheduler.clone(), affinity, label)
    }

    /// `detach`: release the calling thread from worker duty.
    pub fn detach(&self) -> Result<()> {
        sched::worker::detach()
    }

    /// `self()`: the task executing on the calling worker thread, if any.
    pub fn current_task(&self) -> Option<Arc<Task>> {
        sched::worker::current_task()
    }

    /// `get_execution_id()`.
    pub fn current_execution_id(&self) -> Option<u32> {
        sched::worker::current_execution_id()
    }

    /// The logical CPU the calling worker thread is currently servicing.
    pub fn current_cpu(&self) -> Option<CpuId> {
        sched::worker::current_cpu()
    }

    /// `set_task_affinity`.
    pub fn set_task_affinity(&self, task: &Arc<Task>, affinity: Affinity) -> Result<()> {
        affinity.validate(self.scheduler.topology())?;
        task.set_affinity(affinity);
        Ok(())
    }

    /// `get_task_affinity`.
    pub fn get_task_affinity(&self, task: &Arc<Task>) -> Affinity {
        task.affinity()
    }

    /// `set_task_degree`: change a not-yet-fully-dispatched task's replica
    /// count.
    pub fn set_task_degree(&self, task: &Arc<Task>, degree: i32) -> Result<()> {
        if degree == 0 {
            return Err(RuntimeError::InvalidParameter { name: "degree" });
        }
        task.set_degree(degree);
        Ok(())
    }

    /// `get_task_degree`.
    pub fn get_task_degree(&self, task: &Arc<Task>) -> i32 {
        task.degree()
    }

    /// Number of tasks served since startup, exposed for monitoring.
    pub fn metrics(&self) -> &Metrics {
        self.scheduler.metrics()
    }

    /// Signals shutdown and waits for every worker thread to observe it
    /// and exit. Workers poll `is_shutdown` between dispatches (§5); any
    /// task paused indefinitely via `pause` will not itself be woken by
    /// shutdown, matching the teacher's "shutdown does not cancel
    /// outstanding blocking waits" convention.
    pub fn shutdown(mut self) {
        self.scheduler.request_shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scheduler.request_shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runtime_end_to_end_submit_and_run() {
        let runtime = Runtime::start(Arc::new(FlatTopology::uma(2)), RuntimeConfig::default()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_cb = ran.clone();
        let ty = runtime
            .type_init(
                "e2e",
                Pid(1),
                Some(Box::new(move |_h: &TaskHandle| {
                    ran_cb.fetch_add(1, Ordering::SeqCst);
                })),
                None,
                None,
                None,
                TypeFlags::empty(),
            )
            .unwrap();
        let task = runtime.create(ty, Vec::new(), CreateFlags::empty()).unwrap();
        runtime.submit(task, SubmitFlags::empty(), 0).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        runtime.shutdown();
    }

    #[test]
    fn strict_affinity_validated_against_topology() {
        let runtime = Runtime::start(Arc::new(FlatTopology::uma(2)), RuntimeConfig::default()).unwrap();
        let ty = runtime
            .type_init("bad", Pid(1), Some(Box::new(|_: &TaskHandle| {})), None, None, None, TypeFlags::empty())
            .unwrap();
        let task = runtime.create(ty, Vec::new(), CreateFlags::empty()).unwrap();
        let result = runtime.set_task_affinity(&task, Affinity::cpu(99, AffinityKind::Strict));
        assert!(result.is_err());
        runtime.shutdown();
    }
}
