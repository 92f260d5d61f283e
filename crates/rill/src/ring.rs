// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Lock-free in-process ring buffers for fixed-rate sample transfer.
//!
//! Two forms with one contract:
//!
//! - [`RingBuffer`] — single writer, `READERS` independent readers, each
//!   with its own cache-line-isolated tail. The writer keeps a private
//!   cached minimum tail so the common-case free-space check costs one
//!   relaxed load instead of an O(READERS) acquire scan.
//! - [`SpscRing`] — the single-reader form. Same protocol with the tail
//!   scan loop collapsed to one reload; exists only for the measurable
//!   fast-path win, the external contract is identical.
//!
//! # Synchronization protocol
//!
//! Head and tails are unbounded absolute sequence numbers; slot index is
//! `seq % CAP`. Every store that makes data visible (head after a write,
//! tail after a read) is Release; every load that consumes the other
//! side's progress is Acquire. The writer re-reads its own head and its
//! private tail cache with Relaxed — it is the only thread that writes
//! them.
//!
//! Copies are two-phase: one `copy_nonoverlapping` up to the wrap
//! boundary, a second for the remainder. The regions never overlap
//! because `head - min(tails) <= CAP` holds at all times.
//!
//! # Caller obligations
//!
//! Exactly one thread may call [`RingBuffer::write`] and each reader
//! index must be driven by at most one thread. This is the generated
//! pipeline topology's invariant, not something the ring enforces.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free single-writer, multi-reader ring of trivially-copyable
/// elements.
///
/// Every reader observes the full stream: an element is only overwritten
/// once *all* readers have consumed it, so the slowest reader bounds the
/// writer.
pub struct RingBuffer<T: Copy, const CAP: usize, const READERS: usize> {
    /// Absolute write cursor.
    head: CachePadded<AtomicUsize>,
    /// Absolute read cursors, cache-line isolated per reader.
    tails: [CachePadded<AtomicUsize>; READERS],
    /// Writer-private cached minimum tail (single-writer field).
    cached_min_tail: UnsafeCell<usize>,
    /// Element storage. Slots in `[min(tails), head)` are initialized.
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: cross-thread access is mediated by the head/tail protocol above.
// cached_min_tail and the storage cells are only touched by the single
// writer (documented caller obligation) or by readers inside their
// acquired window.
unsafe impl<T: Copy + Send, const CAP: usize, const READERS: usize> Send
    for RingBuffer<T, CAP, READERS>
{
}
unsafe impl<T: Copy + Send, const CAP: usize, const READERS: usize> Sync
    for RingBuffer<T, CAP, READERS>
{
}

impl<T: Copy, const CAP: usize, const READERS: usize> Default for RingBuffer<T, CAP, READERS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const CAP: usize, const READERS: usize> RingBuffer<T, CAP, READERS> {
    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        const {
            assert!(CAP > 0, "RingBuffer capacity must be > 0");
            assert!(READERS > 0, "RingBuffer must have at least one reader");
        }
        let mut buf = Vec::with_capacity(CAP);
        buf.resize_with(CAP, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tails: std::array::from_fn(|_| CachePadded::new(AtomicUsize::new(0))),
            cached_min_tail: UnsafeCell::new(0),
            buf: buf.into_boxed_slice(),
        }
    }

    /// Ring capacity in elements.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Number of configured readers.
    #[must_use]
    pub const fn readers(&self) -> usize {
        READERS
    }

    /// Make `src` visible to every reader. Fails without a partial write
    /// if fewer than `src.len()` slots are free for the slowest reader.
    ///
    /// Single-writer only (see module docs).
    pub fn write(&self, src: &[T]) -> bool {
        let count = src.len();
        let h = self.head.load(Ordering::Relaxed);

        // SAFETY: cached_min_tail is written and read only by the single
        // writer thread; no concurrent access exists.
        let cached = unsafe { &mut *self.cached_min_tail.get() };

        // Fast path: check against the cached minimum tail.
        let mut used = h.wrapping_sub(*cached);
        if used > CAP || CAP - used < count {
            // Slow path: rescan all tails and refresh the cache.
            let mut mt = self.tails[0].load(Ordering::Acquire);
            for tail in &self.tails[1..] {
                let t = tail.load(Ordering::Acquire);
                if t < mt {
                    mt = t;
                }
            }
            *cached = mt;
            used = h.wrapping_sub(mt);
            if used > CAP || CAP - used < count {
                return false;
            }
        }

        self.copy_in(h, src);
        self.head.store(h.wrapping_add(count), Ordering::Release);
        true
    }

    /// Consume `dst.len()` elements for the given reader. Fails without a
    /// partial read if fewer elements are available, or if `reader_idx`
    /// is out of range.
    pub fn read_from(&self, reader_idx: usize, dst: &mut [T]) -> bool {
        if reader_idx >= READERS {
            return false;
        }
        let count = dst.len();
        let t = self.tails[reader_idx].load(Ordering::Relaxed);
        let h = self.head.load(Ordering::Acquire);
        let avail = h.wrapping_sub(t);
        if count > avail {
            return false;
        }

        self.copy_out(t, dst);
        self.tails[reader_idx].store(t.wrapping_add(count), Ordering::Release);
        true
    }

    /// Consume for reader 0.
    pub fn read(&self, dst: &mut [T]) -> bool {
        self.read_from(0, dst)
    }

    /// Elements available to the given reader (0 for an invalid index).
    #[must_use]
    pub fn available(&self, reader_idx: usize) -> usize {
        if reader_idx >= READERS {
            return 0;
        }
        let h = self.head.load(Ordering::Acquire);
        let t = self.tails[reader_idx].load(Ordering::Acquire);
        h.wrapping_sub(t)
    }

    /// Two-phase copy of `src` into the slots starting at absolute `seq`.
    fn copy_in(&self, seq: usize, src: &[T]) {
        let count = src.len();
        let start = seq % CAP;
        let first = count.min(CAP - start);
        // SAFETY: the free-space check guarantees the target slots are
        // outside every reader's `[tail, head)` window, so no reader
        // touches them concurrently. Both phase regions lie within the
        // CAP-element slab and do not overlap src (caller-owned slice).
        unsafe {
            let base = self.buf.as_ptr() as *mut MaybeUninit<T>;
            ptr::copy_nonoverlapping(src.as_ptr().cast(), base.add(start), first);
            if first < count {
                ptr::copy_nonoverlapping(src.as_ptr().add(first).cast(), base, count - first);
            }
        }
    }

    /// Two-phase copy out of the slots starting at absolute `seq`.
    fn copy_out(&self, seq: usize, dst: &mut [T]) {
        let count = dst.len();
        let start = seq % CAP;
        let first = count.min(CAP - start);
        // SAFETY: availability was established after an Acquire load of
        // head, so the source slots were initialized by the writer and
        // published with Release. The writer cannot overwrite them until
        // this reader's tail advances.
        unsafe {
            let base = self.buf.as_ptr() as *const MaybeUninit<T>;
            ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr().cast(), first);
            if first < count {
                ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first).cast(), count - first);
            }
        }
    }
}

/// Single-writer, single-reader ring — the `READERS = 1` fast path.
///
/// Identical contract to [`RingBuffer`] with one tail; the writer's slow
/// path is a single tail reload instead of a scan.
pub struct SpscRing<T: Copy, const CAP: usize> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    /// Writer-private cached tail (single-writer field).
    cached_tail: UnsafeCell<usize>,
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: same protocol as RingBuffer with a single reader tail.
unsafe impl<T: Copy + Send, const CAP: usize> Send for SpscRing<T, CAP> {}
unsafe impl<T: Copy + Send, const CAP: usize> Sync for SpscRing<T, CAP> {}

impl<T: Copy, const CAP: usize> Default for SpscRing<T, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const CAP: usize> SpscRing<T, CAP> {
    /// Create an empty ring.
    #[must_use]
    pub fn new() -> Self {
        const {
            assert!(CAP > 0, "SpscRing capacity must be > 0");
        }
        let mut buf = Vec::with_capacity(CAP);
        buf.resize_with(CAP, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            cached_tail: UnsafeCell::new(0),
            buf: buf.into_boxed_slice(),
        }
    }

    /// Ring capacity in elements.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Make `src` visible to the reader. Single-writer only.
    pub fn write(&self, src: &[T]) -> bool {
        let count = src.len();
        let h = self.head.load(Ordering::Relaxed);

        // SAFETY: cached_tail is a single-writer field (see module docs).
        let cached = unsafe { &mut *self.cached_tail.get() };

        let mut used = h.wrapping_sub(*cached);
        if used > CAP || CAP - used < count {
            *cached = self.tail.load(Ordering::Acquire);
            used = h.wrapping_sub(*cached);
            if used > CAP || CAP - used < count {
                return false;
            }
        }

        let start = h % CAP;
        let first = count.min(CAP - start);
        // SAFETY: same slot-disjointness argument as RingBuffer::copy_in.
        unsafe {
            let base = self.buf.as_ptr() as *mut MaybeUninit<T>;
            ptr::copy_nonoverlapping(src.as_ptr().cast(), base.add(start), first);
            if first < count {
                ptr::copy_nonoverlapping(src.as_ptr().add(first).cast(), base, count - first);
            }
        }
        self.head.store(h.wrapping_add(count), Ordering::Release);
        true
    }

    /// Consume `dst.len()` elements. `reader_idx` is accepted for contract
    /// parity with [`RingBuffer`]; any index but 0 fails.
    pub fn read_from(&self, reader_idx: usize, dst: &mut [T]) -> bool {
        if reader_idx != 0 {
            return false;
        }
        self.read(dst)
    }

    /// Consume `dst.len()` elements. Fails without a partial read if
    /// fewer are available.
    pub fn read(&self, dst: &mut [T]) -> bool {
        let count = dst.len();
        let t = self.tail.load(Ordering::Relaxed);
        let h = self.head.load(Ordering::Acquire);
        if count > h.wrapping_sub(t) {
            return false;
        }

        let start = t % CAP;
        let first = count.min(CAP - start);
        // SAFETY: same published-window argument as RingBuffer::copy_out.
        unsafe {
            let base = self.buf.as_ptr() as *const MaybeUninit<T>;
            ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr().cast(), first);
            if first < count {
                ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first).cast(), count - first);
            }
        }
        self.tail.store(t.wrapping_add(count), Ordering::Release);
        true
    }

    /// Elements available to the reader.
    #[must_use]
    pub fn available(&self, reader_idx: usize) -> usize {
        if reader_idx != 0 {
            return 0;
        }
        let h = self.head.load(Ordering::Acquire);
        let t = self.tail.load(Ordering::Acquire);
        h.wrapping_sub(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    // The SPSC form must be observationally identical to the generic ring
    // at READERS = 1, so the contract tests run against both.
    macro_rules! contract_tests {
        ($mod_name:ident, $ring:ty) => {
            mod $mod_name {
                use super::*;

                #[test]
                fn empty_read_fails() {
                    let ring = <$ring>::new();
                    let mut out = [0u32; 1];
                    assert!(!ring.read(&mut out));
                    assert_eq!(ring.available(0), 0);
                }

                #[test]
                fn zero_count_ops_succeed_without_mutation() {
                    let ring = <$ring>::new();
                    assert!(ring.write(&[] as &[u32]));
                    assert!(ring.read(&mut [] as &mut [u32]));
                    assert_eq!(ring.available(0), 0);
                }

                #[test]
                fn write_read_roundtrip() {
                    let ring = <$ring>::new();
                    assert!(ring.write(&[1u32, 2, 3, 4]));
                    assert_eq!(ring.available(0), 4);
                    let mut out = [0u32; 4];
                    assert!(ring.read(&mut out));
                    assert_eq!(out, [1, 2, 3, 4]);
                    assert_eq!(ring.available(0), 0);
                }

                #[test]
                fn exact_fill_then_one_more_fails() {
                    let ring = <$ring>::new();
                    let data = [7u32; 8];
                    assert!(ring.write(&data));
                    assert!(!ring.write(&[1u32]));
                    let mut out = [0u32; 1];
                    assert!(ring.read(&mut out));
                    assert!(ring.write(&[1u32]));
                }

                #[test]
                fn wrap_preserves_order() {
                    // Capacity 8: write 6, read 4, write 5 (wraps), read 7.
                    let ring = <$ring>::new();
                    assert!(ring.write(&[1u32, 2, 3, 4, 5, 6]));
                    let mut out4 = [0u32; 4];
                    assert!(ring.read(&mut out4));
                    assert_eq!(out4, [1, 2, 3, 4]);
                    assert!(ring.write(&[10u32, 20, 30, 40, 50]));
                    let mut out7 = [0u32; 7];
                    assert!(ring.read(&mut out7));
                    assert_eq!(out7, [5, 6, 10, 20, 30, 40, 50]);
                }

                #[test]
                fn invalid_reader_index_fails_safely() {
                    let ring = <$ring>::new();
                    assert!(ring.write(&[1u32]));
                    let mut out = [0u32; 1];
                    assert!(!ring.read_from(5, &mut out));
                    assert_eq!(ring.available(5), 0);
                }

                #[test]
                fn oversized_write_fails() {
                    let ring = <$ring>::new();
                    let data = [0u32; 9];
                    assert!(!ring.write(&data));
                    assert_eq!(ring.available(0), 0);
                }
            }
        };
    }

    contract_tests!(generic_r1, RingBuffer<u32, 8, 1>);
    contract_tests!(spsc, SpscRing<u32, 8>);

    #[test]
    fn spsc_stress_fifo_order() {
        // One writer pushes 0..100_000 in chunks of 64 through a ring of
        // capacity 1024; the reader must observe the exact sequence.
        let ring = Arc::new(SpscRing::<u32, 1024>::new());
        let total: u32 = 100_000;

        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut next = 0u32;
                let mut chunk = [0u32; 64];
                while next < total {
                    let want = ((total - next) as usize).min(chunk.len());
                    if ring.read(&mut chunk[..want]) {
                        for &v in &chunk[..want] {
                            assert_eq!(v, next);
                            next += 1;
                        }
                    } else {
                        thread::yield_now();
                    }
                }
                next
            })
        };

        let mut chunk = [0u32; 64];
        let mut sent = 0u32;
        while sent < total {
            let want = ((total - sent) as usize).min(chunk.len());
            for (i, slot) in chunk[..want].iter_mut().enumerate() {
                *slot = sent + i as u32;
            }
            if ring.write(&chunk[..want]) {
                sent += want as u32;
            } else {
                thread::yield_now();
            }
        }

        assert_eq!(reader.join().expect("reader panicked"), total);
    }

    #[test]
    fn multi_reader_each_sees_full_stream() {
        let ring = Arc::new(RingBuffer::<u32, 256, 3>::new());
        let total: u32 = 10_000;

        let mut handles = Vec::new();
        for reader_idx in 0..3 {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                let mut next = 0u32;
                let mut chunk = [0u32; 32];
                while next < total {
                    let want = ((total - next) as usize).min(chunk.len());
                    if ring.read_from(reader_idx, &mut chunk[..want]) {
                        for &v in &chunk[..want] {
                            assert_eq!(v, next);
                            next += 1;
                        }
                    } else {
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut chunk = [0u32; 32];
        let mut sent = 0u32;
        while sent < total {
            let want = ((total - sent) as usize).min(chunk.len());
            for (i, slot) in chunk[..want].iter_mut().enumerate() {
                *slot = sent + i as u32;
            }
            if ring.write(&chunk[..want]) {
                sent += want as u32;
            } else {
                thread::yield_now();
            }
        }

        for h in handles {
            h.join().expect("reader panicked");
        }
    }

    #[test]
    fn slow_reader_bounds_writer() {
        let ring = RingBuffer::<u32, 16, 2>::new();
        let data = [0u32; 16];
        assert!(ring.write(&data));

        // Reader 0 drains fully, reader 1 stays put.
        let mut out = [0u32; 16];
        assert!(ring.read_from(0, &mut out));

        // The slowest reader still holds the whole window.
        assert!(!ring.write(&[1u32]));

        let mut one = [0u32; 1];
        assert!(ring.read_from(1, &mut one));
        assert!(ring.write(&[1u32]));
    }

    #[test]
    fn randomized_interleaving_matches_model() {
        let ring = SpscRing::<u64, 64>::new();
        let mut model = std::collections::VecDeque::new();
        let mut next_val = 0u64;
        fastrand::seed(0x5EED);

        for _ in 0..10_000 {
            if fastrand::bool() {
                let n = fastrand::usize(0..=16);
                let chunk: Vec<u64> = (0..n).map(|i| next_val + i as u64).collect();
                let ok = ring.write(&chunk);
                assert_eq!(ok, model.len() + n <= 64);
                if ok {
                    next_val += n as u64;
                    model.extend(chunk);
                }
            } else {
                let n = fastrand::usize(0..=16);
                let mut out = vec![0u64; n];
                let ok = ring.read(&mut out);
                assert_eq!(ok, n <= model.len());
                if ok {
                    for v in out {
                        assert_eq!(v, model.pop_front().unwrap());
                    }
                }
            }
        }
    }
}
