//! Model-checked concurrency tests for the two hand-rolled lock-free
//! primitives (§8.1's loom tooling expansion). Only compiled under
//! `RUSTFLAGS="--cfg loom" cargo test --test loom_tests --release`; a plain
//! `cargo test` run skips this file entirely since `cfg(loom)` is false.

#![cfg(loom)]

use std::sync::Arc;

use dtsched::sched::dtlock::{DtLock, DtStatus};
use dtsched::sched::spsc::SpscRing;
use dtsched::task::{Affinity, CreateFlags, Pid, Task, TaskType, TypeFlags};

#[test]
fn dtlock_exactly_one_server_drains_both_tickets() {
    loom::model(|| {
        let lock = Arc::new(DtLock::<u64, u64>::new(2, 0u64, 4));
        let l0 = lock.clone();
        let l1 = lock.clone();

        let t0 = loom::thread::spawn(move || l0.call(0, |d| *d));
        let t1 = loom::thread::spawn(move || l1.call(1, |d| {
            *d += 1;
            *d
        }));

        let r0 = t0.join().unwrap();
        let r1 = t1.join().unwrap();
        // t1 always observes and increments whatever value was there when
        // its ticket drained, so it always returns 1. t0 only reads, so it
        // sees 0 if it drained first or 1 if t1 drained first — either way
        // the two requests never execute concurrently with each other.
        assert_eq!(r1, 1);
        assert!(r0 == 0 || r0 == 1);
    });
}

#[test]
fn dtlock_call_never_observes_the_lock_mid_mutation() {
    loom::model(|| {
        let lock = Arc::new(DtLock::<(u64, u64), ()>::new(2, (0, 0), 4));
        let l0 = lock.clone();
        let l1 = lock.clone();

        let t0 = loom::thread::spawn(move || {
            l0.call(0, |d| {
                d.0 += 1;
                d.1 += 1;
            });
        });
        let t1 = loom::thread::spawn(move || {
            l1.call(1, |d| {
                d.0 += 1;
                d.1 += 1;
            });
        });

        t0.join().unwrap();
        t1.join().unwrap();

        let total = lock.call(0, |d| d.0 + d.1);
        // Each call() bumps both fields together under exclusive access;
        // if a server ever ran concurrently with another mutation, the two
        // fields would be able to drift apart.
        assert_eq!(total, 4);
    });
}

fn dummy_task() -> Arc<Task> {
    let ty = TaskType::new(
        "loom",
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
fn spsc_ring_single_producer_single_consumer_no_loss() {
    loom::model(|| {
        let ring = Arc::new(SpscRing::new(2));
        let producer_ring = ring.clone();

        let producer = loom::thread::spawn(move || {
            for _ in 0..3 {
                while producer_ring.push(dummy_task()).is_err() {
                    loom::thread::yield_now();
                }
            }
        });

        let mut received = 0;
        while received < 3 {
            if ring.pop().is_some() {
                received += 1;
            } else {
                loom::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, 3);
    });
}
