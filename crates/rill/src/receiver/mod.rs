// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Receiver stack — stream reconstruction for live monitoring.
//!
//! Monitors observe running pipelines from outside: a
//! [`PpktReceiver`] reassembles logical frames from PPKT datagrams per
//! channel, and a [`ShmReceiver`] taps a PSHM ring directly. Both push
//! reconstructed f32 samples into per-channel [`SampleStore`]s and
//! expose thread-safe snapshots plus integrity counters.
//!
//! Integrity faults (lost packets, mid-frame gaps, metadata drift) are
//! never errors here — they are per-channel counters a monitor renders
//! next to the waveform.

mod assemble;
mod convert;
mod ppkt;
mod shm;
mod store;

pub use assemble::{ChannelTable, FrameAssembler, FrameStats};
pub use convert::{convert_to_f32, dtype_sample_bytes};
pub use ppkt::PpktReceiver;
pub use shm::{shm_chan_id, ShmReceiver};
pub use store::SampleStore;

/// Snapshot of one channel's state, safe to render while the receive
/// thread keeps running.
#[derive(Debug, Default, Clone)]
pub struct ChannelSnapshot {
    pub chan_id: u16,
    pub sample_rate_hz: f64,
    pub packet_count: u64,
    pub stats: FrameStats,
    pub samples: Vec<f32>,
    /// Human-readable source label (e.g. `shm:rx.iq`); empty means the
    /// renderer labels by channel id.
    pub label: String,
}

/// Lock-free receiver-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverMetrics {
    pub recv_packets: u64,
    pub recv_bytes: u64,
}
