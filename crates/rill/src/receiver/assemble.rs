// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Frame assembly — reconstructing logical frames from PPKT packets.
//!
//! A logical frame is bracketed by `FLAG_FRAME_START` and
//! `FLAG_FRAME_END`; all its chunks share a dtype, rate, and start
//! timestamp, with consecutive sequence numbers and contiguous
//! iteration indices. Anything that breaks those rules drops the frame
//! and bumps the matching counter — the stream itself is never
//! interrupted.
//!
//! State is split deliberately:
//! - [`FrameAssembler`] is receive-thread-local: pending frames
//!   accumulate without any lock.
//! - [`ChannelTable`] is shared with snapshot readers under one mutex,
//!   taken briefly per packet outcome.
//!
//! Iteration indices also stitch *between* frames: a jump between the
//! end of one frame and the start of the next means the kernel dropped
//! whole packets on the floor. The channel's sample store is cleared on
//! such a gap so the rendered waveform never splices across missing
//! data.

use super::convert::convert_to_f32;
use super::store::SampleStore;
use super::ChannelSnapshot;
use crate::net::{
    ppkt_validate, PpktHeader, FLAG_FIRST_FRAME, FLAG_FRAME_END, FLAG_FRAME_START, PPKT_HEADER_LEN,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Largest sample count converted from a single packet.
const MAX_CONVERTED_SAMPLES: usize = 8192;

/// Per-channel frame integrity counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub accepted_frames: u64,
    pub dropped_frames: u64,
    /// Sequence discontinuity inside a frame
    pub drop_seq_gap: u64,
    /// Iteration-index discontinuity inside a frame
    pub drop_iter_gap: u64,
    /// Missing start/end boundary
    pub drop_boundary: u64,
    /// dtype/rate/timestamp changed mid-frame
    pub drop_meta_mismatch: u64,
    /// Kernel-level packet loss detected between frames
    pub inter_frame_gaps: u64,
}

#[derive(Debug, Clone, Copy)]
enum DropReason {
    SeqGap,
    IterGap,
    Boundary,
    MetaMismatch,
}

/// Shared per-channel state, mutated under the table mutex.
pub struct ChannelState {
    pub chan_id: u16,
    pub sample_rate_hz: f64,
    pub last_sequence: u32,
    pub packet_count: u64,
    pub store: SampleStore,
    pub stats: FrameStats,
}

impl ChannelState {
    fn new(chan_id: u16, store_capacity: usize) -> Self {
        Self {
            chan_id,
            sample_rate_hz: 0.0,
            last_sequence: 0,
            packet_count: 0,
            store: SampleStore::new(store_capacity),
            stats: FrameStats::default(),
        }
    }
}

/// Channel map shared between a receive thread and snapshot readers.
pub struct ChannelTable {
    channels: Mutex<BTreeMap<u16, ChannelState>>,
    store_capacity: usize,
}

impl ChannelTable {
    /// New table whose channels hold `store_capacity` samples each.
    #[must_use]
    pub fn new(store_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(BTreeMap::new()),
            store_capacity,
        }
    }

    /// Run `f` on the (created-on-demand) channel entry.
    fn with_channel<R>(&self, chan_id: u16, f: impl FnOnce(&mut ChannelState) -> R) -> R {
        let mut channels = self.channels.lock();
        let ch = channels
            .entry(chan_id)
            .or_insert_with(|| ChannelState::new(chan_id, self.store_capacity));
        f(ch)
    }

    /// Snapshot every channel for rendering.
    #[must_use]
    pub fn snapshot(&self, max_samples: usize) -> Vec<ChannelSnapshot> {
        let mut out = Vec::new();
        self.snapshot_into(&mut out, max_samples);
        out
    }

    /// Fill a caller-owned snapshot vector, reusing its allocations.
    /// Steady-state calls after the first perform no heap allocation.
    pub fn snapshot_into(&self, out: &mut Vec<ChannelSnapshot>, max_samples: usize) {
        let channels = self.channels.lock();
        out.resize_with(channels.len(), ChannelSnapshot::default);
        for (snap, ch) in out.iter_mut().zip(channels.values()) {
            snap.chan_id = ch.chan_id;
            snap.sample_rate_hz = ch.sample_rate_hz;
            snap.packet_count = ch.packet_count;
            snap.stats = ch.stats;
            snap.label.clear();
            snap.samples.resize(max_samples, 0.0);
            let n = ch.store.snapshot(&mut snap.samples, max_samples);
            snap.samples.truncate(n);
        }
    }

    /// Frame stats for one channel, if it exists yet.
    #[must_use]
    pub fn stats(&self, chan_id: u16) -> Option<FrameStats> {
        self.channels.lock().get(&chan_id).map(|ch| ch.stats)
    }

    /// Drop every channel (monitor-side reconnect).
    pub fn clear(&self) {
        self.channels.lock().clear();
    }

    /// Number of channels seen so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether any channel has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }
}

#[derive(Debug, Default)]
struct PendingFrame {
    active: bool,
    expected_sequence: u32,
    start_timestamp_ns: u64,
    next_iteration: u64,
    dtype: u8,
    sample_rate_hz: f64,
    samples: Vec<f32>,
}

impl PendingFrame {
    fn reset(&mut self) {
        self.active = false;
        self.samples.clear();
    }
}

#[derive(Debug, Default)]
struct ChannelRecvState {
    pending: PendingFrame,
    iter_tracking: bool,
    next_expected_iter: u64,
}

/// Receive-thread-local frame assembler.
///
/// Feed raw datagrams through [`FrameAssembler::process_packet`];
/// committed frames land in the shared [`ChannelTable`].
pub struct FrameAssembler {
    recv_state: BTreeMap<u16, ChannelRecvState>,
    conv_buf: Vec<f32>,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            recv_state: BTreeMap::new(),
            conv_buf: vec![0.0; MAX_CONVERTED_SAMPLES],
        }
    }

    /// Forget all pending frames and tracking state (monitor reconnect).
    pub fn reset(&mut self) {
        self.recv_state.clear();
    }

    /// Decode and assemble one raw datagram. Invalid packets are
    /// dropped silently; integrity faults are counted on the channel.
    pub fn process_packet(&mut self, packet: &[u8], table: &ChannelTable) {
        if packet.len() < PPKT_HEADER_LEN || !ppkt_validate(packet) {
            return;
        }
        let Some(hdr) = PpktHeader::decode(packet) else {
            return;
        };
        let payload = &packet[PPKT_HEADER_LEN..];
        if payload.len() < hdr.payload_bytes as usize {
            return;
        }
        let payload = &payload[..hdr.payload_bytes as usize];

        let converted = convert_to_f32(
            payload,
            hdr.sample_count as usize,
            hdr.dtype,
            &mut self.conv_buf,
        );
        if converted == 0 {
            return;
        }

        let rs = self.recv_state.entry(hdr.chan_id).or_default();
        assemble(&hdr, &self.conv_buf[..converted], rs, table);
    }
}

fn record_drop(ch: &mut ChannelState, reason: DropReason) {
    ch.stats.dropped_frames += 1;
    match reason {
        DropReason::SeqGap => ch.stats.drop_seq_gap += 1,
        DropReason::IterGap => ch.stats.drop_iter_gap += 1,
        DropReason::Boundary => ch.stats.drop_boundary += 1,
        DropReason::MetaMismatch => ch.stats.drop_meta_mismatch += 1,
    }
}

/// Assemble one decoded packet into the channel's pending frame.
/// `rs` is receive-thread-local; the table lock is only taken at the
/// terminal outcome of each branch.
fn assemble(hdr: &PpktHeader, samples: &[f32], rs: &mut ChannelRecvState, table: &ChannelTable) {
    let is_start = hdr.flags & FLAG_FRAME_START != 0;
    let is_end = hdr.flags & FLAG_FRAME_END != 0;
    let sample_count = samples.len() as u64;

    if is_start {
        if rs.pending.active {
            // Previous frame never closed.
            table.with_channel(hdr.chan_id, |ch| {
                ch.packet_count += 1;
                record_drop(ch, DropReason::Boundary);
            });
            rs.pending.reset();
        }

        // Inter-frame continuity: a sender restart re-anchors tracking,
        // otherwise a jump in iteration index means kernel-level loss.
        if hdr.flags & FLAG_FIRST_FRAME != 0 {
            rs.iter_tracking = false;
        }
        let has_gap = rs.iter_tracking && hdr.iteration_index != rs.next_expected_iter;

        rs.pending.active = true;
        rs.pending.expected_sequence = hdr.sequence.wrapping_add(1);
        rs.pending.start_timestamp_ns = hdr.timestamp_ns;
        rs.pending.next_iteration = hdr.iteration_index + sample_count;
        rs.pending.dtype = hdr.dtype;
        rs.pending.sample_rate_hz = hdr.sample_rate_hz;
        rs.pending.samples.clear();
        rs.pending.samples.extend_from_slice(samples);

        if is_end {
            // Single-chunk frame commits immediately.
            table.with_channel(hdr.chan_id, |ch| {
                ch.sample_rate_hz = hdr.sample_rate_hz;
                ch.last_sequence = hdr.sequence;
                ch.packet_count += 1;
                if has_gap {
                    ch.stats.inter_frame_gaps += 1;
                    ch.store.clear();
                }
                ch.stats.accepted_frames += 1;
                ch.store.push(&rs.pending.samples);
            });
            rs.pending.reset();
            rs.iter_tracking = true;
            rs.next_expected_iter = hdr.iteration_index + sample_count;
        } else {
            table.with_channel(hdr.chan_id, |ch| {
                ch.sample_rate_hz = hdr.sample_rate_hz;
                ch.last_sequence = hdr.sequence;
                ch.packet_count += 1;
                if has_gap {
                    ch.stats.inter_frame_gaps += 1;
                    ch.store.clear();
                }
            });
        }
        return;
    }

    // Continuation or end chunk without a preceding start.
    if !rs.pending.active {
        table.with_channel(hdr.chan_id, |ch| {
            ch.packet_count += 1;
            record_drop(ch, DropReason::Boundary);
        });
        rs.pending.reset();
        return;
    }

    if hdr.sequence != rs.pending.expected_sequence {
        table.with_channel(hdr.chan_id, |ch| {
            ch.packet_count += 1;
            record_drop(ch, DropReason::SeqGap);
        });
        rs.pending.reset();
        return;
    }

    if hdr.iteration_index != rs.pending.next_iteration {
        table.with_channel(hdr.chan_id, |ch| {
            ch.packet_count += 1;
            record_drop(ch, DropReason::IterGap);
        });
        rs.pending.reset();
        return;
    }

    if hdr.timestamp_ns != rs.pending.start_timestamp_ns
        || hdr.dtype != rs.pending.dtype
        || hdr.sample_rate_hz != rs.pending.sample_rate_hz
    {
        table.with_channel(hdr.chan_id, |ch| {
            ch.packet_count += 1;
            record_drop(ch, DropReason::MetaMismatch);
        });
        rs.pending.reset();
        return;
    }

    // Contiguous chunk: accumulate lock-free.
    rs.pending.samples.extend_from_slice(samples);
    rs.pending.expected_sequence = hdr.sequence.wrapping_add(1);
    rs.pending.next_iteration = hdr.iteration_index + sample_count;

    if is_end {
        table.with_channel(hdr.chan_id, |ch| {
            ch.sample_rate_hz = hdr.sample_rate_hz;
            ch.last_sequence = hdr.sequence;
            ch.packet_count += 1;
            ch.stats.accepted_frames += 1;
            ch.store.push(&rs.pending.samples);
        });
        rs.iter_tracking = true;
        rs.next_expected_iter = rs.pending.next_iteration;
        rs.pending.reset();
    } else {
        table.with_channel(hdr.chan_id, |ch| {
            ch.last_sequence = hdr.sequence;
            ch.packet_count += 1;
        });
    }
}
