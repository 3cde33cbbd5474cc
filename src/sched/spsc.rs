//! Fixed-capacity single-producer/single-consumer ring
//!
//! Grounded on the teacher's `kernel/src/sched/percpu_queue.rs` (a
//! cache-line-padded, power-of-two-capacity ring with atomic head/tail
//! cursors), generalized here from `*mut Task` storage to `Option<Arc<Task>>`
//! slots so the ring owns its `Arc` clones.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;

#[cfg(not(loom))]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicUsize, Ordering};

use crate::task::Task;

#[repr(align(64))]
struct CachePadded<T>(T);

/// A lock-free bounded ring for exactly one producer and one consumer.
///
/// Capacity must be a power of two; indices wrap via a mask rather than a
/// modulo. `head` is owned by the consumer, `tail` by the producer; each
/// only ever reads the other's cursor with `Acquire` and only ever publishes
/// its own with `Release`, per the standard SPSC ring protocol.
pub struct SpscRing {
    mask: usize,
    buf: Box<[UnsafeCell<MaybeUninit<Arc<Task>>>]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: `buf` slots are only ever written by the single producer (via
// `push`) and only ever read-then-cleared by the single consumer (via
// `pop`), and the head/tail handshake below ensures a slot is never
// observed by the consumer before the producer's write to it has
// happened-before, nor reused by the producer before the consumer's read
// has happened-before.
unsafe impl Sync for SpscRing {}
unsafe impl Send for SpscRing {}

impl SpscRing {
    /// Creates a ring holding up to `capacity` entries. `capacity` must be a
    /// power of two (the caller validates this via
    /// [`crate::config::RuntimeConfig::validate`]).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let mut buf = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            buf.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Self {
            mask: capacity - 1,
            buf: buf.into_boxed_slice(),
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Producer-only: attempts to push `task`. Returns `Err(task)` if the
    /// ring is full.
    pub fn push(&self, task: Arc<Task>) -> Result<(), Arc<Task>> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity() {
            return Err(task);
        }
        let idx = tail & self.mask;
        // SAFETY: this slot is past `head`, so the consumer has already
        // vacated it (or never occupied it); the producer is the only
        // writer to this index.
        unsafe {
            (*self.buf[idx].get()).write(task);
        }
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer-only: pops the oldest entry, or `None` if empty.
    pub fn pop(&self) -> Option<Arc<Task>> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = head & self.mask;
        // SAFETY: `idx` was published by the producer (tail > head means
        // this slot's write happened-before this load of `tail`); the
        // consumer is the only reader/clearer of this index.
        let task = unsafe { (*self.buf[idx].get()).assume_init_read() };
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Some(task)
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SpscRing {
    fn drop(&mut self) {
        let head = *self.head.0.get_mut();
        let tail = *self.tail.0.get_mut();
        let mut cur = head;
        while cur != tail {
            let idx = cur & self.mask;
            // SAFETY: single-threaded at this point (we have `&mut self`);
            // every slot in [head, tail) holds an initialized `Arc<Task>`.
            unsafe {
                (*self.buf[idx].get()).assume_init_drop();
            }
            cur = cur.wrapping_add(1);
        }
    }
}
