// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Periodic tick generator with hybrid sleep+spin scheduling.
//!
//! A [`Tick`] converts a target frequency into a monotonic deadline
//! schedule. Each `wait()` sleeps for the bulk of the period, then
//! optionally busy-spins across the final window to absorb scheduler
//! wake jitter. In adaptive mode the spin window is sized by an EWMA of
//! observed wake jitter, clamped to `[MIN_SPIN_NS, MAX_SPIN_NS]` — long
//! enough to matter, short enough not to burn a core.
//!
//! Overrun is a normal return condition, never an error: the caller's
//! overrun policy (drop, slip, backlog) decides what happens next.

use crate::config::{INIT_SPIN_NS, MAX_SPIN_NS, MIN_SPIN_NS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Spin behavior for the tail of each tick period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinMode {
    /// Sleep until the deadline; no spin.
    None,
    /// Sleep until `deadline - ns`, then spin.
    Fixed(u64),
    /// EWMA-calibrated spin window, bootstrapped at [`INIT_SPIN_NS`].
    Adaptive,
}

impl SpinMode {
    /// Decode the shell-surface integer form: negative selects adaptive,
    /// zero disables spinning, positive is a fixed window in nanoseconds.
    #[must_use]
    pub fn from_raw(spin_ns: i64) -> Self {
        if spin_ns < 0 {
            SpinMode::Adaptive
        } else if spin_ns == 0 {
            SpinMode::None
        } else {
            SpinMode::Fixed(spin_ns as u64)
        }
    }
}

/// Periodic tick generator. One per task thread; no shared state.
pub struct Tick {
    period: Duration,
    next: Instant,
    overrun: bool,
    last_latency: Duration,
    measure_latency: bool,
    spin_threshold: Duration,
    adaptive: bool,
    ewma_jitter_ns: i64,
}

impl Tick {
    /// Create a generator at `freq_hz` with latency measurement on and no
    /// spin window.
    #[must_use]
    pub fn new(freq_hz: f64) -> Self {
        Self::with_spin(freq_hz, true, SpinMode::None)
    }

    /// Create a generator with an explicit spin mode.
    ///
    /// The first deadline is one period from now.
    #[must_use]
    pub fn with_spin(freq_hz: f64, measure_latency: bool, spin: SpinMode) -> Self {
        let period = Duration::from_secs_f64(1.0 / freq_hz);
        let (spin_threshold, adaptive) = match spin {
            SpinMode::None => (Duration::ZERO, false),
            SpinMode::Fixed(ns) => (Duration::from_nanos(ns), false),
            SpinMode::Adaptive => (Duration::from_nanos(INIT_SPIN_NS), true),
        };
        Self {
            period,
            next: Instant::now() + period,
            overrun: false,
            last_latency: Duration::ZERO,
            measure_latency,
            spin_threshold,
            adaptive,
            ewma_jitter_ns: 0,
        }
    }

    /// Block until the next deadline, then advance it by one period.
    ///
    /// If the deadline has already passed, returns immediately with the
    /// overrun flag set (the deadline still advances by exactly one
    /// period — backlog handling is the caller's policy).
    pub fn wait(&mut self) {
        let now = Instant::now();
        if now < self.next {
            if self.spin_threshold > Duration::ZERO {
                // Hybrid: sleep for the bulk, spin across the tail.
                let sleep_target = self.next - self.spin_threshold;
                if now < sleep_target {
                    std::thread::sleep(sleep_target - now);
                }
                let wake_point = Instant::now();
                while Instant::now() < self.next {
                    std::hint::spin_loop();
                }

                if self.adaptive {
                    // Jitter = how late we woke vs the requested sleep target.
                    let jitter_ns = wake_point
                        .saturating_duration_since(sleep_target)
                        .as_nanos()
                        .min(i64::MAX as u128) as i64;
                    // EWMA update, alpha = 1/8.
                    self.ewma_jitter_ns += (jitter_ns - self.ewma_jitter_ns) / 8;
                    let new_spin =
                        (self.ewma_jitter_ns * 2).clamp(MIN_SPIN_NS as i64, MAX_SPIN_NS as i64);
                    self.spin_threshold = Duration::from_nanos(new_spin as u64);
                }
            } else {
                std::thread::sleep(self.next - now);
            }
            self.overrun = false;
            if self.measure_latency {
                self.last_latency = Instant::now().saturating_duration_since(self.next);
            }
        } else {
            self.overrun = true;
            if self.measure_latency {
                self.last_latency = now.saturating_duration_since(self.next);
            }
        }
        self.next += self.period;
    }

    /// Whether the most recent `wait` found its deadline already passed.
    #[must_use]
    pub fn overrun(&self) -> bool {
        self.overrun
    }

    /// Wake latency recorded by the most recent `wait` (zero when
    /// measurement is disabled).
    #[must_use]
    pub fn last_latency(&self) -> Duration {
        self.last_latency
    }

    /// Whether the spin window is EWMA-calibrated.
    #[must_use]
    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    /// Current spin window.
    #[must_use]
    pub fn current_spin_threshold(&self) -> Duration {
        self.spin_threshold
    }

    /// Whole periods between now and the next deadline (0 when on
    /// schedule). Used by backlog overrun policies.
    #[must_use]
    pub fn missed_count(&self) -> u64 {
        let now = Instant::now();
        if now < self.next {
            return 0;
        }
        (now.saturating_duration_since(self.next).as_nanos() / self.period.as_nanos()) as u64 + 1
    }

    /// Re-anchor the schedule to `now + period` and clear the overrun
    /// flag. Used by slip overrun policies.
    pub fn reset_phase(&mut self) {
        self.next = Instant::now() + self.period;
        self.overrun = false;
    }

    /// The configured period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Cumulative per-task tick statistics.
///
/// All fields are atomic so a `&'static TaskStats` can be shared between
/// the task thread recording ticks and the shell reading the totals at
/// exit.
#[derive(Debug)]
pub struct TaskStats {
    ticks: AtomicU64,
    missed: AtomicU64,
    max_latency_ns: AtomicU64,
    total_latency_ns: AtomicU64,
}

impl TaskStats {
    /// New zeroed accumulator (const: usable in statics).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            missed: AtomicU64::new(0),
            max_latency_ns: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
        }
    }

    /// Record one tick and its wake latency.
    pub fn record_tick(&self, latency: Duration) {
        let ns = latency.as_nanos().min(u64::MAX as u128) as u64;
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(ns, Ordering::Relaxed);
        self.total_latency_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Record one missed tick.
    pub fn record_miss(&self) {
        self.missed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn max_latency_ns(&self) -> u64 {
        self.max_latency_ns.load(Ordering::Relaxed)
    }

    /// Mean wake latency over all recorded ticks (0 with no ticks).
    #[must_use]
    pub fn avg_latency_ns(&self) -> u64 {
        let ticks = self.ticks();
        if ticks == 0 {
            return 0;
        }
        self.total_latency_ns.load(Ordering::Relaxed) / ticks
    }
}

impl Default for TaskStats {
    fn default() -> Self {
        Self::new()
    }
}
