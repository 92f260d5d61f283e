// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! PSHM monitoring receiver.
//!
//! A monitor attaches to rings it did not compile against, so it
//! discovers dtype, geometry, and rate from the superblock via
//! [`crate::shm::probe`] and skips the stable-id check. One
//! [`ShmReceiver`] instance watches one ring on its own poll thread.

use super::convert::{convert_to_f32, dtype_sample_bytes};
use super::store::SampleStore;
use super::{ChannelSnapshot, FrameStats, ReceiverMetrics};
use crate::config::{DEFAULT_STORE_CAPACITY, SHM_POLL_SLEEP_US};
use crate::net::DType;
use crate::shm::{self, probe, ShmInfo, ShmReader, StreamContract};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Deterministic channel id for an SHM source name, mapped into
/// [0x8001, 0xFFFF] so it cannot collide with compiled PPKT channels.
/// Stable across runs for the same name.
#[must_use]
pub fn shm_chan_id(name: &str, salt: u16) -> u16 {
    let mut h = shm::hash_endpoint_name(name);
    h ^= u64::from(salt);
    h = h.wrapping_mul(0x100_0000_01b3);
    ((h % 0x7FFE) + 0x8001) as u16
}

struct Shared {
    store: SampleStore,
    sample_rate_hz: f64,
    slots_seen: u64,
    stats: FrameStats,
}

/// Single-ring SHM receiver for monitoring.
pub struct ShmReceiver {
    name: String,
    chan_id: u16,
    label: String,
    buffer_capacity: usize,
    shared: Arc<Mutex<Shared>>,
    recv_slots: Arc<AtomicU64>,
    recv_bytes: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ShmReceiver {
    /// New receiver for the named ring (not yet attached).
    #[must_use]
    pub fn new(name: &str, chan_id: u16) -> Self {
        Self::with_capacity(name, chan_id, DEFAULT_STORE_CAPACITY)
    }

    /// New receiver with an explicit sample store capacity.
    #[must_use]
    pub fn with_capacity(name: &str, chan_id: u16, buffer_capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            chan_id,
            label: format!("shm:{name}"),
            buffer_capacity,
            shared: Arc::new(Mutex::new(Shared {
                store: SampleStore::new(buffer_capacity),
                sample_rate_hz: 0.0,
                slots_seen: 0,
                stats: FrameStats::default(),
            })),
            recv_slots: Arc::new(AtomicU64::new(0)),
            recv_bytes: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Probe the ring, attach with the discovered parameters, and start
    /// the poll thread.
    pub fn start(&mut self) -> shm::Result<()> {
        let info = probe(&self.name)?;
        let Some(dtype) = DType::from_code(info.dtype) else {
            return Err(shm::ShmError::InvalidLayout(format!(
                "'{}': unknown dtype code {}",
                self.name, info.dtype
            )));
        };

        let contract = StreamContract {
            dtype,
            rank: info.rank,
            dims: info.dims,
            tokens_per_frame: info.tokens_per_frame,
            rate_hz: info.rate_hz,
            // Monitors attach to foreign rings; skip the stable-id check.
            stable_id_hash: 0,
        };
        let reader = ShmReader::attach(
            &self.name,
            info.slot_count,
            info.slot_payload_bytes,
            &contract,
        )?;

        self.shared.lock().sample_rate_hz = info.rate_hz;
        self.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let recv_slots = Arc::clone(&self.recv_slots);
        let recv_bytes = Arc::clone(&self.recv_bytes);
        let running = Arc::clone(&self.running);

        self.thread = Some(std::thread::spawn(move || {
            poll_loop(reader, &info, &shared, &recv_slots, &recv_bytes, &running);
        }));
        Ok(())
    }

    /// Stop the poll thread and detach.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Fill one snapshot for this ring. Safe while the poll thread runs.
    pub fn snapshot_into(&self, out: &mut ChannelSnapshot, max_samples: usize) {
        let shared = self.shared.lock();
        out.chan_id = self.chan_id;
        out.sample_rate_hz = shared.sample_rate_hz;
        out.packet_count = shared.slots_seen;
        out.stats = shared.stats;
        out.label.clear();
        out.label.push_str(&self.label);
        out.samples.resize(max_samples, 0.0);
        let n = shared.store.snapshot(&mut out.samples, max_samples);
        out.samples.truncate(n);
    }

    /// Drop all buffered samples and counters.
    pub fn clear(&self) {
        let mut shared = self.shared.lock();
        shared.store.clear();
        shared.stats = FrameStats::default();
        shared.slots_seen = 0;
    }

    /// Lock-free slot/byte counters.
    #[must_use]
    pub fn metrics(&self) -> ReceiverMetrics {
        ReceiverMetrics {
            recv_packets: self.recv_slots.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn chan_id(&self) -> u16 {
        self.chan_id
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

impl Drop for ShmReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    mut reader: ShmReader,
    info: &ShmInfo,
    shared: &Mutex<Shared>,
    recv_slots: &AtomicU64,
    recv_bytes: &AtomicU64,
    running: &AtomicBool,
) {
    let mut raw_buf = vec![0u8; info.slot_payload_bytes as usize];
    // Worst case one float per payload byte (i8 samples).
    let mut conv_buf = vec![0.0f32; info.slot_payload_bytes as usize];
    let sample_bytes = dtype_sample_bytes(info.dtype);

    while running.load(Ordering::Acquire) {
        let bytes = reader.consume(&mut raw_buf);
        if bytes == 0 {
            std::thread::sleep(Duration::from_micros(SHM_POLL_SLEEP_US));
            continue;
        }

        recv_slots.fetch_add(1, Ordering::Relaxed);
        recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);

        if sample_bytes == 0 {
            continue;
        }
        let sample_count = bytes / sample_bytes;
        let converted = convert_to_f32(&raw_buf[..bytes], sample_count, info.dtype, &mut conv_buf);
        if converted == 0 {
            continue;
        }

        let mut shared = shared.lock();
        shared.store.push(&conv_buf[..converted]);
        shared.stats.accepted_frames += 1;
        shared.slots_seen += 1;
    }
}
