// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Per-thread actor runtime context.
//!
//! Actor bodies that timestamp their output need two values from the task
//! loop that fires them: the current iteration index and the task rate.
//! Threading those through every actor call would pollute the generated
//! call signatures, so the task loop publishes them into a thread-local
//! context before each firing and actors read them back here.
//!
//! `now_ns()` uses `CLOCK_MONOTONIC` rather than `Instant` so that
//! timestamps written into shared memory are comparable across processes
//! on the same host.

use std::cell::Cell;

thread_local! {
    static ITERATION_INDEX: Cell<u64> = const { Cell::new(0) };
    static TASK_RATE_HZ: Cell<f64> = const { Cell::new(0.0) };
}

/// Monotonic wall-free clock in nanoseconds, shared meaning across
/// processes on one host.
#[must_use]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec on this stack frame.
    // clock_gettime(CLOCK_MONOTONIC) cannot fail with a valid clock id
    // and pointer on any supported platform.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, std::ptr::addr_of_mut!(ts));
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Publish the current iteration index for actors on this thread.
pub fn set_iteration_index(iteration_index: u64) {
    ITERATION_INDEX.with(|c| c.set(iteration_index));
}

/// Iteration index of the current task firing (0 outside a task loop).
#[must_use]
pub fn iteration_index() -> u64 {
    ITERATION_INDEX.with(Cell::get)
}

/// Publish the task rate for actors on this thread.
pub fn set_task_rate_hz(rate_hz: f64) {
    TASK_RATE_HZ.with(|c| c.set(rate_hz));
}

/// Rate of the task driving the current thread (0.0 outside a task loop).
#[must_use]
pub fn task_rate_hz() -> f64 {
    TASK_RATE_HZ.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ns_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn context_defaults_zero() {
        std::thread::spawn(|| {
            assert_eq!(iteration_index(), 0);
            assert_eq!(task_rate_hz(), 0.0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn context_roundtrip() {
        set_iteration_index(4096);
        set_task_rate_hz(48_000.0);
        assert_eq!(iteration_index(), 4096);
        assert_eq!(task_rate_hz(), 48_000.0);
    }

    #[test]
    fn context_is_thread_local() {
        set_iteration_index(7);
        std::thread::spawn(|| {
            assert_eq!(iteration_index(), 0);
            set_iteration_index(99);
        })
        .join()
        .unwrap();
        assert_eq!(iteration_index(), 7);
    }
}
