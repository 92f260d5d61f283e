// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! PSHM binary layout — 128-byte superblock and 64-byte slot headers.
//!
//! Both structs are `#[repr(C)]` with every field naturally aligned at
//! its wire offset, so the in-memory representation *is* the on-disk
//! format; no serialization step exists. Fields that one process
//! mutates while another reads are atomics. The constant contract
//! fields (geometry, dtype, dims) are written once by the creator
//! before any reader can map the region, so they stay plain.
//!
//! Cross-process correctness requires genuinely lock-free 4- and 8-byte
//! atomics: a lock-based fallback would put a process-local mutex in
//! memory another process cannot see.

use std::sync::atomic::{AtomicU32, AtomicU64};

/// Superblock magic, ASCII `PSHM`.
pub const PSHM_MAGIC: [u8; 4] = *b"PSHM";

/// Protocol version.
pub const PSHM_VERSION: u8 = 1;

/// Superblock size (and first slot offset).
pub const PSHM_HEADER_LEN: u8 = 128;

/// Slot header size preceding each slot's payload.
pub const SLOT_HEADER_LEN: usize = 64;

/// First slot of a logical frame.
pub const FLAG_FRAME_START: u32 = 1 << 0;

/// Last slot of a logical frame.
pub const FLAG_FRAME_END: u32 = 1 << 1;

/// Sentinel slot marking a stream-identity discontinuity; readers adopt
/// the slot's epoch and resync.
pub const FLAG_EPOCH_FENCE: u32 = 1 << 2;

// The protocol is meaningless if these atomics secretly take a lock:
// a process-local fallback mutex is invisible to the peer process.
#[cfg(not(all(target_has_atomic = "64", target_has_atomic = "32")))]
compile_error!("PSHM requires lock-free 64-bit and 32-bit atomics for cross-process correctness");

/// Superblock — the first 128 bytes of the shared memory object.
#[repr(C)]
pub struct Superblock {
    /// `PSHM`
    pub magic: [u8; 4],
    /// Protocol version (1)
    pub version: u8,
    /// Superblock size (128)
    pub header_len: u8,
    /// Reserved, 0
    pub flags: u16,
    /// Sample type code (as the PPKT dtype enum)
    pub dtype: u8,
    /// Shape rank, 0..8
    pub rank: u8,
    /// Reserved, 0
    pub reserved0: u16,
    /// Logical tokens per task firing
    pub tokens_per_frame: u32,
    /// Ring slot count
    pub slot_count: u32,
    /// Payload bytes per slot, multiple of 8
    pub slot_payload_bytes: u32,
    /// Contract rate (tokens/sec)
    pub rate_hz: f64,
    /// Hash of the compiled endpoint contract
    pub stable_id_hash: u64,
    /// Rebind generation
    pub epoch: AtomicU32,
    /// Reserved, 0
    pub reserved1: u32,
    /// Latest committed sequence (0 = nothing published yet)
    pub write_seq: AtomicU64,
    /// Monotonic writer liveness heartbeat
    pub writer_heartbeat_ns: AtomicU64,
    /// Shape dims; unused entries 0
    pub dims: [u32; 8],
    /// FNV-1a of the normalized endpoint name
    pub endpoint_name_hash: u64,
    /// Reserved, 0
    pub reserved2: [u8; 24],
}

/// Slot header — 64 bytes preceding each slot's payload.
///
/// Sequence numbers start at 1; a `seq` of 0 marks a never-written slot.
#[repr(C)]
pub struct SlotHeader {
    /// Committed sequence number; release-stored last by the writer
    pub seq: AtomicU64,
    /// Epoch generation this slot belongs to
    pub epoch: AtomicU32,
    /// FLAG_FRAME_START / FLAG_FRAME_END / FLAG_EPOCH_FENCE
    pub flags: AtomicU32,
    /// Logical sample offset of the slot's first token
    pub iteration_index: AtomicU64,
    /// Monotonic publish timestamp
    pub timestamp_ns: AtomicU64,
    /// Tokens in the payload
    pub token_count: AtomicU32,
    /// Bytes in the payload
    pub payload_bytes: AtomicU32,
    /// Reserved, 0
    pub reserved: [u8; 24],
}

// Bit-exact layout: any drift here is silent cross-process corruption.
const _: () = assert!(std::mem::size_of::<Superblock>() == 128);
const _: () = assert!(std::mem::size_of::<SlotHeader>() == SLOT_HEADER_LEN);
const _: () = assert!(std::mem::offset_of!(Superblock, dtype) == 8);
const _: () = assert!(std::mem::offset_of!(Superblock, tokens_per_frame) == 12);
const _: () = assert!(std::mem::offset_of!(Superblock, slot_count) == 16);
const _: () = assert!(std::mem::offset_of!(Superblock, slot_payload_bytes) == 20);
const _: () = assert!(std::mem::offset_of!(Superblock, rate_hz) == 24);
const _: () = assert!(std::mem::offset_of!(Superblock, stable_id_hash) == 32);
const _: () = assert!(std::mem::offset_of!(Superblock, epoch) == 40);
const _: () = assert!(std::mem::offset_of!(Superblock, write_seq) == 48);
const _: () = assert!(std::mem::offset_of!(Superblock, writer_heartbeat_ns) == 56);
const _: () = assert!(std::mem::offset_of!(Superblock, dims) == 64);
const _: () = assert!(std::mem::offset_of!(Superblock, endpoint_name_hash) == 96);
const _: () = assert!(std::mem::offset_of!(Superblock, reserved2) == 104);
const _: () = assert!(std::mem::offset_of!(SlotHeader, seq) == 0);
const _: () = assert!(std::mem::offset_of!(SlotHeader, epoch) == 8);
const _: () = assert!(std::mem::offset_of!(SlotHeader, flags) == 12);
const _: () = assert!(std::mem::offset_of!(SlotHeader, iteration_index) == 16);
const _: () = assert!(std::mem::offset_of!(SlotHeader, timestamp_ns) == 24);
const _: () = assert!(std::mem::offset_of!(SlotHeader, token_count) == 32);
const _: () = assert!(std::mem::offset_of!(SlotHeader, payload_bytes) == 36);
const _: () = assert!(std::mem::offset_of!(SlotHeader, reserved) == 40);

impl Superblock {
    /// Check magic, version, and header_len.
    #[must_use]
    pub fn validate(&self) -> bool {
        self.magic == PSHM_MAGIC
            && self.version == PSHM_VERSION
            && self.header_len == PSHM_HEADER_LEN
    }
}
