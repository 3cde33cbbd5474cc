//! Delegation lock
//!
//! A ticket-based mutex where, instead of every waiter eventually acquiring
//! the lock itself, whichever CPU's ticket happens to match the current
//! "serving" ticket becomes a transient *server*: it executes not only its
//! own request but every other waiter's request it can find already posted,
//! in ticket order, depositing each result directly into that waiter's
//! per-CPU slot. A waiter that finds its own result already deposited never
//! touches the lock at all.
//!
//! Grounded on the teacher's `kernel/src/sched/numa.rs` (per-CPU slot
//! arrays) and the ticket-dispensing style of `kernel/src/sync/` primitives,
//! generalized from a plain mutual-exclusion lock to a request/result
//! delegation protocol per §4.3/§7 of the design.

use std::cell::UnsafeCell;

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::DtLockError;

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const SERVED: u8 = 2;

/// Outcome of posting or polling a request.
pub enum DtStatus<R> {
    /// A result was deposited by some server; it is now owned by the
    /// caller and the slot has been released back to idle.
    Served(R),
    /// No result yet; the caller's ticket has not come up. Retry later
    /// (spin, yield, or fall back to other work).
    EAgain,
    /// The caller's own ticket is now being served: it must call
    /// [`DtLock::serve`] to drain the queue (which includes its own
    /// request) and obtain its result.
    Server,
}

struct Slot<T, R> {
    state: AtomicU8,
    ticket: AtomicU64,
    request: UnsafeCell<Option<Box<dyn FnOnce(&mut T) -> R + Send>>>,
    result: UnsafeCell<Option<R>>,
}

// SAFETY: `request`/`result` are written by at most one thread (the slot's
// owning CPU posts the request; exactly one server thread at a time, under
// the ticket protocol, reads the request and writes the result) before the
// corresponding `state` transition publishes them with `Release`, and every
// other thread only reads them after observing that transition with
// `Acquire`.
unsafe impl<T, R> Sync for Slot<T, R> {}

impl<T, R> Slot<T, R> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            ticket: AtomicU64::new(0),
            request: UnsafeCell::new(None),
            result: UnsafeCell::new(None),
        }
    }
}

/// A delegation lock protecting state `T`, whose requests each produce a
/// value of type `R`.
pub struct DtLock<T, R> {
    data: UnsafeCell<T>,
    next_ticket: AtomicU64,
    serving: AtomicU64,
    slots: Vec<Slot<T, R>>,
    /// Upper bound on how many tickets a single server episode drains,
    /// bounding one CPU's time spent serving others (fairness, §4.3).
    max_combine: usize,
}

// SAFETY: `data` is only ever accessed by the single CPU holding the
// "serving" ticket at any instant (the ticket protocol in `serve`
// guarantees mutual exclusion over `data` the same way a conventional lock
// would); `T: Send` lets it cross the thread boundary between poster and
// server.
unsafe impl<T: Send, R: Send> Sync for DtLock<T, R> {}

impl<T, R> DtLock<T, R> {
    pub fn new(ncpu: usize, data: T, max_combine: usize) -> Self {
        assert!(ncpu > 0, "ncpu must be nonzero");
        assert!(max_combine > 0, "max_combine must be nonzero");
        let mut slots = Vec::with_capacity(ncpu);
        slots.resize_with(ncpu, Slot::new);
        Self {
            data: UnsafeCell::new(data),
            next_ticket: AtomicU64::new(0),
            serving: AtomicU64::new(0),
            slots,
            max_combine,
        }
    }

    /// Posts a new request on behalf of `cpu`. `cpu`'s slot must currently
    /// be idle (no prior request awaiting collection), else
    /// [`DtLockError::WaitqueueFull`].
    pub fn enter<F>(&self, cpu: usize, request: F) -> Result<DtStatus<R>, DtLockError>
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let slot = &self.slots[cpu];
        if slot.state.load(Ordering::Acquire) != IDLE {
            return Err(DtLockError::WaitqueueFull);
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::AcqRel);
        // SAFETY: state is IDLE (just observed, and only this CPU posts to
        // its own slot), so no other thread reads `request` until the
        // `PENDING` store below publishes it.
        unsafe {
            *slot.request.get() = Some(Box::new(request));
        }
        slot.ticket.store(ticket, Ordering::Relaxed);
        slot.state.store(PENDING, Ordering::Release);
        if ticket == self.serving.load(Ordering::Acquire) {
            Ok(DtStatus::Server)
        } else {
            Ok(DtStatus::EAgain)
        }
    }

    /// Polls `cpu`'s slot without posting anything new.
    pub fn poll(&self, cpu: usize) -> DtStatus<R> {
        let slot = &self.slots[cpu];
        match slot.state.load(Ordering::Acquire) {
            SERVED => {
                // SAFETY: state==SERVED was just observed with Acquire,
                // matching the server's Release store in `serve`; the
                // result is visible and this is the only thread that will
                // ever collect it.
                let result = unsafe { (*slot.result.get()).take() }.expect("served slot without a result");
                slot.state.store(IDLE, Ordering::Release);
                DtStatus::Served(result)
            }
            PENDING => {
                if slot.ticket.load(Ordering::Relaxed) == self.serving.load(Ordering::Acquire) {
                    DtStatus::Server
                } else {
                    DtStatus::EAgain
                }
            }
            _ => DtStatus::EAgain,
        }
    }

    /// Drains the ticket queue starting at `cpu`'s own ticket (the caller
    /// must have just received [`DtStatus::Server`] for `cpu`), executing
    /// every contiguously-posted pending request in ticket order and
    /// depositing each result into its owner's slot, up to `max_combine`
    /// requests. Returns the caller's own result.
    pub fn serve(&self, cpu: usize) -> R {
        // SAFETY: the ticket protocol guarantees exactly one CPU holds the
        // "server" role for the current `serving` value at a time, so
        // `data` has a unique mutable borrow for the duration of this call.
        let data = unsafe { &mut *self.data.get() };
        let mut current = self.serving.load(Ordering::Acquire);
        let mut own_result: Option<R> = None;
        for _ in 0..self.max_combine {
            let Some(found) = self.find_pending(current) else {
                break;
            };
            let slot = &self.slots[found];
            // SAFETY: slot.state==PENDING with ticket==current was just
            // observed under Acquire, so the request stored by its poster
            // is visible; only the server reads/clears it, and only once.
            let request = unsafe { (*slot.request.get()).take() }.expect("pending slot without a request");
            let result = request(data);
            if found == cpu {
                own_result = Some(result);
                slot.state.store(IDLE, Ordering::Release);
            } else {
                // SAFETY: only the server writes `result`, and only while
                // this slot is PENDING (not yet visible to its poster);
                // the subsequent Release store publishes it.
                unsafe {
                    *slot.result.get() = Some(result);
                }
                slot.state.store(SERVED, Ordering::Release);
            }
            current = current.wrapping_add(1);
        }
        self.serving.store(current, Ordering::Release);
        own_result.expect("server's own ticket was not found in its own drain pass")
    }

    fn find_pending(&self, ticket: u64) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.state.load(Ordering::Acquire) == PENDING && slot.ticket.load(Ordering::Relaxed) == ticket
        })
    }

    /// Convenience wrapper: posts a request and blocks the calling thread
    /// (spinning) until a result is available, serving the queue itself
    /// whenever it is selected as server. Intended for tests and for
    /// callers outside the cooperative worker loop; the worker loop itself
    /// uses `enter`/`poll`/`serve` directly so it never spins unboundedly.
    pub fn call<F>(&self, cpu: usize, request: F) -> R
    where
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        match self.enter(cpu, request).expect("slot must be idle before call()") {
            DtStatus::Server => self.serve(cpu),
            DtStatus::Served(r) => r,
            DtStatus::EAgain => loop {
                match self.poll(cpu) {
                    DtStatus::Served(r) => return r,
                    DtStatus::Server => return self.serve(cpu),
                    DtStatus::EAgain => std::hint::spin_loop(),
                }
            },
        }
    }
}
