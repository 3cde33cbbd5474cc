//! Task and task-type data model
//!
//! Grounded on the teacher's `kernel/src/sched/task.rs` (`Priority`,
//! `CpuSet`, `TaskStats`) and `task_ptr.rs` (a thin handle wrapper), but
//! tasks are addressed by `Arc<Task>` rather than `NonNull<Task>` — see
//! SPEC_FULL.md §9.1 "Arena addressing" for why that's the appropriate
//! realization once `std`/`alloc` are unconditionally available.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use bitflags::bitflags;

use crate::config::MAX_METADATA_SIZE;
use crate::error::{AffinityError, Result, RuntimeError};
use crate::topology::{CpuId, Topology};

/// Identifier of a client process that has submitted work.
///
/// The process registry itself (mapping a `Pid` to a real OS process) is an
/// external collaborator (§1); the scheduler only needs this small,
/// `Copy`, totally-ordered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, monotonically increasing task identity used for logging, test
/// assertions and `Eq`/`Hash` — never for addressing (tasks are addressed by
/// `Arc<Task>` clone, see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> TaskId {
    TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
}

/// Affinity level: what kind of locality a task is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityLevel {
    /// No preference; matches any CPU.
    None,
    /// Pinned to a specific logical CPU (`index` is the CPU id).
    Cpu,
    /// Pinned to a specific NUMA node (`index` is the node id).
    Numa,
    /// Opaque, caller-defined complex affinity; treated as permissive by
    /// the core (§4.5's `task_affine` predicate).
    UserComplex,
}

/// Whether an affinity is a hard requirement or a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityKind {
    /// A hint: may be stolen from, falls back to other queues.
    Preferred,
    /// A hard requirement: never stolen from, never runs elsewhere.
    Strict,
}

/// A task's CPU/NUMA locality preference or requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affinity {
    pub level: AffinityLevel,
    pub kind: AffinityKind,
    pub index: u32,
}

impl Affinity {
    pub const fn none() -> Self {
        Self {
            level: AffinityLevel::None,
            kind: AffinityKind::Preferred,
            index: 0,
        }
    }

    pub const fn cpu(index: u32, kind: AffinityKind) -> Self {
        Self {
            level: AffinityLevel::Cpu,
            kind,
            index,
        }
    }

    pub const fn numa(index: u32, kind: AffinityKind) -> Self {
        Self {
            level: AffinityLevel::Numa,
            kind,
            index,
        }
    }

    pub fn validate(&self, topology: &dyn Topology) -> Result<()> {
        match self.level {
            AffinityLevel::Cpu if self.index >= topology.ncpu() => {
                Err(AffinityError::CpuOutOfRange {
                    cpu: self.index,
                    ncpu: topology.ncpu(),
                }
                .into())
            }
            AffinityLevel::Numa if self.index >= topology.nnuma() => {
                Err(AffinityError::NumaOutOfRange {
                    numa: self.index,
                    nnuma: topology.nnuma(),
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self.kind, AffinityKind::Strict)
    }
}

/// `task_affine(task, cpu)` from §4.5: does `task`'s affinity permit running
/// on `cpu`?
pub fn task_affine(affinity: &Affinity, cpu: CpuId, topology: &dyn Topology) -> bool {
    match affinity.level {
        AffinityLevel::None | AffinityLevel::UserComplex => true,
        AffinityLevel::Cpu => affinity.index == topology.system_id(cpu),
        AffinityLevel::Numa => topology.numa_of(cpu) == affinity.index,
    }
}

/// Deadline state driving the `DEADLINE_WAKE` race described in §4.8/§9.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeadlineState {
    None = 0,
    Pending = 1,
    Waiting = 2,
    Ready = 3,
}

impl DeadlineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Pending,
            2 => Self::Waiting,
            _ => Self::Ready,
        }
    }
}

bitflags! {
    /// Flags accepted by `submit`. `IMMEDIATE`, `BLOCKING`, `INLINE` and
    /// `DEADLINE_WAKE` are mutually exclusive; `UNLOCKED` composes with any
    /// of them and suppresses the rescue-drain/served instrumentation
    /// counters for this dispatch (§6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        const IMMEDIATE     = 0b0000_0001;
        const BLOCKING      = 0b0000_0010;
        const INLINE        = 0b0000_0100;
        const DEADLINE_WAKE = 0b0000_1000;
        const UNLOCKED      = 0b0001_0000;
    }
}

impl SubmitFlags {
    const MODIFIERS: Self = Self::from_bits_truncate(
        Self::IMMEDIATE.bits() | Self::BLOCKING.bits() | Self::INLINE.bits() | Self::DEADLINE_WAKE.bits(),
    );

    /// `true` if at most one of the mutually-exclusive modifiers is set.
    pub fn is_valid(self) -> bool {
        (self & Self::MODIFIERS).bits().count_ones() <= 1
    }
}

bitflags! {
    /// Flags accepted by `create`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        const PARALLEL = 0b0000_0001;
    }
}

bitflags! {
    /// Flags accepted by `type_init`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        /// `run_callback` may be null: execution is driven entirely by an
        /// external thread via `attach`.
        const EXTERNAL = 0b0000_0001;
    }
}

/// Invoked in a worker context to run a task's body.
pub type RunCallback = Box<dyn Fn(&TaskHandle) + Send + Sync>;
/// Invoked immediately after `run_callback` returns.
pub type EndCallback = Box<dyn Fn(&TaskHandle) + Send + Sync>;
/// Invoked once `event_count` reaches zero; may destroy the task.
pub type CompletedCallback = Box<dyn Fn(&Arc<Task>) + Send + Sync>;
/// Optional cost estimator used by higher-level schedulers; unused by the
/// core's own queue-selection logic.
pub type CostFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// Per-type running statistics, mirroring the teacher's `TaskStats`.
#[derive(Default)]
pub struct TaskTypeStats {
    pub run_count: AtomicU64,
    pub completed_count: AtomicU64,
}

/// Shared, immutable-after-creation descriptor referenced by every task of
/// a kind.
pub struct TaskType {
    pub label: String,
    pub owning_pid: Pid,
    pub typeid: u64,
    pub flags: TypeFlags,
    run_callback: Option<RunCallback>,
    end_callback: Option<EndCallback>,
    completed_callback: Option<CompletedCallback>,
    get_cost: Option<CostFn>,
    pub stats: TaskTypeStats,
}

impl TaskType {
    /// Realizes `type_init`: `run_callback` may be `None` only when
    /// `TypeFlags::EXTERNAL` is set.
    pub fn new(
        label: impl Into<String>,
        owning_pid: Pid,
        run_callback: Option<RunCallback>,
        end_callback: Option<EndCallback>,
        completed_callback: Option<CompletedCallback>,
        get_cost: Option<CostFn>,
        flags: TypeFlags,
    ) -> Result<Arc<Self>> {
        if run_callback.is_none() && !flags.contains(TypeFlags::EXTERNAL) {
            return Err(RuntimeError::InvalidCallback);
        }
        Ok(Arc::new(Self {
            label: label.into(),
            owning_pid,
            typeid: NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed),
            flags,
            run_callback,
            end_callback,
            completed_callback,
            get_cost,
            stats: TaskTypeStats::default(),
        }))
    }

    pub fn cost(&self) -> Option<u64> {
        self.get_cost.as_ref().map(|f| f())
    }
}

/// A bag of tasks a running task's body accumulates for batched submission
/// (§4.6 "Submission batching").
pub struct SubmitWindow {
    pub tasks: Vec<Arc<Task>>,
    pub maxsize: usize,
}

impl SubmitWindow {
    pub fn new(maxsize: usize) -> Self {
        Self {
            tasks: Vec::new(),
            maxsize,
        }
    }

    /// Returns the task back in `Err` when the window is already at
    /// `maxsize`, so the caller can fall back to dispatching it directly.
    pub fn push(&mut self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        if self.tasks.len() >= self.maxsize {
            return Err(task);
        }
        self.tasks.push(task);
        Ok(())
    }

    /// Flush points: explicit flush, before blocking, before yielding,
    /// before pause, before task end.
    pub fn take(&mut self) -> Vec<Arc<Task>> {
        std::mem::take(&mut self.tasks)
    }
}

/// One schedulable unit of work.
pub struct Task {
    id: TaskId,
    pub task_type: Arc<TaskType>,
    metadata: Mutex<Vec<u8>>,
    /// Back-reference to the worker currently executing this task; `-1`
    /// when queued/unowned.
    worker: AtomicI32,
    affinity: Mutex<Affinity>,
    priority: AtomicI32,
    event_count: AtomicU32,
    blocking_count: AtomicI32,
    deadline_ns: AtomicU64,
    deadline_state: AtomicU8,
    /// 0 = not yielded; >0 = served-count trigger at which the yield
    /// expires; -1 = transient marker used while reclassifying.
    yield_trigger: AtomicI64,
    wakeup: Mutex<Option<Arc<Task>>>,
    /// 1 = serial, >1 = parallel replica count, negative = cancelled
    /// (magnitude retained).
    degree: AtomicI32,
    scheduled_count: AtomicU32,
    /// Timestamp (scheduler epoch nanoseconds) this task's current
    /// execution began; used by `schedpoint` to decide whether the
    /// quantum has been exceeded (see `worker::schedpoint`).
    started_ns: AtomicU64,
    pub submit_window: Mutex<SubmitWindow>,
    /// Installed by `pause` when it must block the worker thread; woken by
    /// whichever `decrease_blocking_counter` call observes the count drop
    /// to zero or below (see `worker::pause`).
    pause_signal: Mutex<Option<Arc<PauseSignal>>>,
    /// Set when this task is (re)submitted with `SubmitFlags::UNLOCKED`;
    /// consulted by the scheduler to skip the rescue-drain/served counters
    /// for this dispatch (§6 "disables instrumentation side-effects").
    unlocked: AtomicBool,
}

/// A one-shot wake signal a blocked worker thread waits on inside `pause`.
#[derive(Default)]
pub struct PauseSignal {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl PauseSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wait(&self) {
        let mut guard = self.woken.lock().unwrap();
        while !*guard {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    pub fn wake(&self) {
        let mut guard = self.woken.lock().unwrap();
        *guard = true;
        self.cv.notify_all();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("type", &self.task_type.label)
            .finish_non_exhaustive()
    }
}

/// Maximum tasks a single task body may accumulate before a flush point,
/// absent an explicit override.
pub const DEFAULT_SUBMIT_WINDOW_MAXSIZE: usize = 64;

impl Task {
    /// Realizes `create`: allocates a task with the runtime defaults
    /// (`event_count = 1`, `blocking_count = 1`, caller-supplied affinity).
    pub fn new(
        task_type: Arc<TaskType>,
        metadata: Vec<u8>,
        affinity: Affinity,
        flags: CreateFlags,
    ) -> Result<Arc<Self>> {
        if metadata.len() > MAX_METADATA_SIZE {
            return Err(RuntimeError::InvalidMetadataSize {
                requested: metadata.len(),
                max: MAX_METADATA_SIZE,
            });
        }
        let degree = if flags.contains(CreateFlags::PARALLEL) {
            2
        } else {
            1
        };
        Ok(Arc::new(Self {
            id: next_task_id(),
            task_type,
            metadata: Mutex::new(metadata),
            worker: AtomicI32::new(-1),
            affinity: Mutex::new(affinity),
            priority: AtomicI32::new(0),
            event_count: AtomicU32::new(1),
            blocking_count: AtomicI32::new(1),
            deadline_ns: AtomicU64::new(0),
            deadline_state: AtomicU8::new(DeadlineState::None as u8),
            yield_trigger: AtomicI64::new(0),
            wakeup: Mutex::new(None),
            degree: AtomicI32::new(degree),
            scheduled_count: AtomicU32::new(0),
            started_ns: AtomicU64::new(0),
            submit_window: Mutex::new(SubmitWindow::new(DEFAULT_SUBMIT_WINDOW_MAXSIZE)),
            pause_signal: Mutex::new(None),
            unlocked: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn metadata(&self) -> Vec<u8> {
        self.metadata.lock().unwrap().clone()
    }

    pub fn set_metadata(&self, data: Vec<u8>) -> Result<()> {
        if data.len() > MAX_METADATA_SIZE {
            return Err(RuntimeError::InvalidMetadataSize {
                requested: data.len(),
                max: MAX_METADATA_SIZE,
            });
        }
        *self.metadata.lock().unwrap() = data;
        Ok(())
    }

    pub fn worker(&self) -> Option<u32> {
        let w = self.worker.load(Ordering::Acquire);
        if w < 0 {
            None
        } else {
            Some(w as u32)
        }
    }

    pub fn set_worker(&self, worker: Option<u32>) {
        self.worker
            .store(worker.map_or(-1, |w| w as i32), Ordering::Release);
    }

    pub fn affinity(&self) -> Affinity {
        *self.affinity.lock().unwrap()
    }

    pub fn set_affinity(&self, affinity: Affinity) {
        *self.affinity.lock().unwrap() = affinity;
    }

    pub fn is_affine(&self, cpu: CpuId, topology: &dyn Topology) -> bool {
        task_affine(&self.affinity(), cpu, topology)
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Pid of the client process that owns this task, via its type.
    pub fn pid(&self) -> Pid {
        self.task_type.owning_pid
    }

    // --- event count: gates task completion ---

    pub fn event_count(&self) -> u32 {
        self.event_count.load(Ordering::Acquire)
    }

    /// `increase_event_counter`: delay completion for `n` outstanding
    /// external events.
    pub fn increase_event_counter(&self, n: u32) {
        self.event_count.fetch_add(n, Ordering::AcqRel);
    }

    /// `decrease_event_counter`: resolve `n` outstanding events. Returns
    /// `true` exactly when the count transitions to zero (the task has
    /// completed and `completed_callback` must run).
    pub fn decrease_event_counter(&self, n: u32) -> bool {
        let prev = self.event_count.fetch_sub(n, Ordering::AcqRel);
        assert!(prev >= n, "event_count underflow: impossible internal state");
        prev == n
    }

    // --- blocking count: gates task readiness ---

    pub fn blocking_count(&self) -> i32 {
        self.blocking_count.load(Ordering::Acquire)
    }

    /// Returns `true` if this decrement made the task ready (count reached
    /// or passed zero for the first time from above).
    pub fn decrease_blocking_counter(&self) -> bool {
        let prev = self.blocking_count.fetch_sub(1, Ordering::AcqRel);
        prev == 1
    }

    /// `task_pause`: increment `blocking_count`; returns the value after
    /// the increment (caller yields the worker iff it is still positive).
    pub fn increase_blocking_counter(&self) -> i32 {
        self.blocking_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Installs a fresh [`PauseSignal`] this task's own blocked worker will
    /// wait on; returns it so the caller can block on the same instance.
    pub fn install_pause_signal(&self) -> Arc<PauseSignal> {
        let signal = PauseSignal::new();
        *self.pause_signal.lock().unwrap() = Some(signal.clone());
        signal
    }

    /// Takes and wakes the pause signal, if one is installed (a no-op if
    /// the task was never paused, e.g. `BLOCKING` completion racing a
    /// pause that was already cancelled).
    pub fn wake_pause_signal(&self) {
        if let Some(signal) = self.pause_signal.lock().unwrap().take() {
            signal.wake();
        }
    }

    /// `true` while this task's worker thread is blocked inside `pause`
    /// (i.e. mid-execution, not queued). A submit landing on a paused task
    /// must cancel the pause in place rather than re-dispatch it, since
    /// dispatching it to another worker would re-run it from scratch.
    pub fn is_paused(&self) -> bool {
        self.pause_signal.lock().unwrap().is_some()
    }

    // --- deadline ---

    pub fn deadline_ns(&self) -> u64 {
        self.deadline_ns.load(Ordering::Relaxed)
    }

    pub fn set_deadline_ns(&self, ns: u64) {
        self.deadline_ns.store(ns, Ordering::Relaxed);
        self.deadline_state.store(
            if ns == 0 {
                DeadlineState::None as u8
            } else {
                DeadlineState::Pending as u8
            },
            Ordering::Relaxed,
        );
    }

    pub fn clear_deadline(&self) {
        self.deadline_ns.store(0, Ordering::Relaxed);
        self.deadline_state
            .store(DeadlineState::None as u8, Ordering::Relaxed);
    }

    pub fn deadline_state(&self) -> DeadlineState {
        DeadlineState::from_u8(self.deadline_state.load(Ordering::Acquire))
    }

    pub fn set_deadline_state(&self, state: DeadlineState) {
        self.deadline_state.store(state as u8, Ordering::Release);
    }

    /// `DEADLINE_WAKE`: CAS from `WAITING`/`PENDING` to `READY`. Returns
    /// `true` iff this call won the race.
    pub fn deadline_wake(&self) -> bool {
        let waiting = DeadlineState::Waiting as u8;
        let pending = DeadlineState::Pending as u8;
        let ready = DeadlineState::Ready as u8;
        self.deadline_state
            .compare_exchange(waiting, ready, Ordering::AcqRel, Ordering::Acquire)
            .or_else(|_| {
                self.deadline_state
                    .compare_exchange(pending, ready, Ordering::AcqRel, Ordering::Acquire)
            })
            .is_ok()
    }

    /// Whether the dispatch currently in flight for this task was submitted
    /// with `SubmitFlags::UNLOCKED`.
    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::Relaxed)
    }

    pub fn set_unlocked(&self, unlocked: bool) {
        self.unlocked.store(unlocked, Ordering::Relaxed);
    }

    // --- yield ---

    pub fn yield_trigger(&self) -> i64 {
        self.yield_trigger.load(Ordering::Relaxed)
    }

    pub fn set_yield_trigger(&self, trigger: i64) {
        self.yield_trigger.store(trigger, Ordering::Relaxed);
    }

    pub fn clear_yield(&self) {
        self.yield_trigger.store(0, Ordering::Relaxed);
    }

    pub fn is_yielded(&self) -> bool {
        self.yield_trigger.load(Ordering::Relaxed) != 0
    }

    // --- blocking-submit wakeup chain ---

    pub fn wakeup(&self) -> Option<Arc<Task>> {
        self.wakeup.lock().unwrap().clone()
    }

    pub fn set_wakeup(&self, wakeup: Option<Arc<Task>>) {
        *self.wakeup.lock().unwrap() = wakeup;
    }

    // --- parallel degree ---

    pub fn degree(&self) -> i32 {
        self.degree.load(Ordering::Relaxed)
    }

    pub fn is_parallel(&self) -> bool {
        self.degree().abs() > 1
    }

    pub fn is_cancelled(&self) -> bool {
        self.degree.load(Ordering::Relaxed) < 0
    }

    pub fn set_degree(&self, degree: i32) {
        self.degree.store(degree, Ordering::Relaxed);
    }

    /// CAS-negate `degree` so no further replicas are scheduled; already
    /// dispatched replicas run to completion.
    pub fn cancel(&self) {
        loop {
            let cur = self.degree.load(Ordering::Relaxed);
            if cur < 0 {
                return;
            }
            let negated = -cur;
            if self
                .degree
                .compare_exchange(cur, negated, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn scheduled_count(&self) -> u32 {
        self.scheduled_count.load(Ordering::Relaxed)
    }

    pub fn started_ns(&self) -> u64 {
        self.started_ns.load(Ordering::Relaxed)
    }

    pub fn mark_started(&self, ns: u64) {
        self.started_ns.store(ns, Ordering::Relaxed);
    }

    /// Reserve the next replica's execution id, or `None` if all replicas
    /// (or a cancelled task's remaining replicas) have already been
    /// dispatched.
    pub fn reserve_execution_id(&self) -> Option<u32> {
        if self.is_cancelled() {
            return None;
        }
        let degree = self.degree().unsigned_abs();
        loop {
            let cur = self.scheduled_count.load(Ordering::Acquire);
            if cur >= degree {
                return None;
            }
            if self
                .scheduled_count
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(cur + 1);
            }
        }
    }
}

/// Handle passed to `run_callback`/`end_callback`: the task plus the
/// replica identity for parallel tasks (always `1` for serial tasks).
#[derive(Clone)]
pub struct TaskHandle {
    pub task: Arc<Task>,
    pub execution_id: u32,
}

impl TaskType {
    pub fn run(&self, handle: &TaskHandle) {
        if let Some(cb) = &self.run_callback {
            cb(handle);
        }
        self.stats.run_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end(&self, handle: &TaskHandle) {
        if let Some(cb) = &self.end_callback {
            cb(handle);
        }
    }

    pub fn completed(&self, task: &Arc<Task>) {
        if let Some(cb) = &self.completed_callback {
            cb(task);
        }
        self.stats.completed_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::FlatTopology;

    fn trivial_type() -> Arc<TaskType> {
        TaskType::new(
            "test",
            Pid(1),
            Some(Box::new(|_h: &TaskHandle| {})),
            None,
            None,
            None,
            TypeFlags::empty(),
        )
        .unwrap()
    }

    #[test]
    fn create_requires_run_callback_unless_external() {
        let err = TaskType::new("t", Pid(1), None, None, None, None, TypeFlags::empty());
        assert!(err.is_err());
        let ok = TaskType::new("t", Pid(1), None, None, None, None, TypeFlags::EXTERNAL);
        assert!(ok.is_ok());
    }

    #[test]
    fn metadata_size_enforced() {
        let ty = trivial_type();
        let too_big = vec![0u8; MAX_METADATA_SIZE + 1];
        let res = Task::new(ty, too_big, Affinity::none(), CreateFlags::empty());
        assert!(matches!(res, Err(RuntimeError::InvalidMetadataSize { .. })));
    }

    #[test]
    fn event_count_reaches_zero_exactly_once() {
        let ty = trivial_type();
        let task = Task::new(ty, Vec::new(), Affinity::none(), CreateFlags::empty()).unwrap();
        task.increase_event_counter(2);
        assert_eq!(task.event_count(), 3);
        assert!(!task.decrease_event_counter(1));
        assert!(!task.decrease_event_counter(1));
        assert!(task.decrease_event_counter(1));
    }

    #[test]
    fn cancel_negates_degree_and_is_idempotent() {
        let ty = trivial_type();
        let task = Task::new(ty, Vec::new(), Affinity::none(), CreateFlags::PARALLEL).unwrap();
        assert_eq!(task.degree(), 2);
        task.cancel();
        assert_eq!(task.degree(), -2);
        task.cancel();
        assert_eq!(task.degree(), -2);
    }

    #[test]
    fn affinity_predicate_strict_cpu() {
        let topo = FlatTopology::uma(4);
        let affinity = Affinity::cpu(2, AffinityKind::Strict);
        assert!(task_affine(&affinity, 2, &topo));
        assert!(!task_affine(&affinity, 0, &topo));
    }

    #[test]
    fn affinity_predicate_numa() {
        let topo = FlatTopology::numa(4, 2);
        let affinity = Affinity::numa(1, AffinityKind::Preferred);
        assert!(task_affine(&affinity, 1, &topo));
        assert!(task_affine(&affinity, 3, &topo));
        assert!(!task_affine(&affinity, 0, &topo));
    }

    #[test]
    fn submit_flags_reject_multiple_modifiers() {
        let flags = SubmitFlags::IMMEDIATE | SubmitFlags::BLOCKING;
        assert!(!flags.is_valid());
        assert!((SubmitFlags::IMMEDIATE | SubmitFlags::UNLOCKED).is_valid());
    }
}
