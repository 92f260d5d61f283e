// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Global protocol and runtime constants — single source of truth.
//!
//! Wire-format geometry, spin calibration bounds, and polling cadences all
//! live here. Never hardcode these elsewhere.

// =======================================================================
// PPKT wire protocol
// =======================================================================

/// Default datagram MTU: Ethernet 1500 - IP header 20 - UDP header 8.
pub const PPKT_DEFAULT_MTU: usize = 1472;

/// Largest datagram the receive path will accept (UDP max payload).
pub const MAX_PACKET_BYTES: usize = 65536;

// =======================================================================
// Tick generator spin calibration
// =======================================================================

/// Adaptive spin floor. Spinning less than this is indistinguishable from
/// not spinning at all on contemporary schedulers.
pub const MIN_SPIN_NS: u64 = 500;

/// Adaptive spin ceiling (100 us). Above this the CPU cost outweighs any
/// wake-accuracy gain.
pub const MAX_SPIN_NS: u64 = 100_000;

/// Adaptive spin bootstrap value (10 us) before the EWMA has samples.
pub const INIT_SPIN_NS: u64 = 10_000;

// =======================================================================
// Receiver cadences
// =======================================================================

/// Default per-channel sample store capacity (~1M samples).
pub const DEFAULT_STORE_CAPACITY: usize = 1_000_000;

/// Readiness-poll timeout for receive threads. Bounds how long a stop
/// request can go unobserved.
pub const POLL_TIMEOUT_MS: u64 = 1;

/// Sleep between unsuccessful shared-memory consumes.
pub const SHM_POLL_SLEEP_US: u64 = 10;

/// Datagram drain batch size per readiness event.
pub const RECV_BATCH: usize = 16;

/// Receive buffer request for PPKT sockets. Silently capped by the kernel
/// (`net.core.rmem_max`) unless the process holds CAP_NET_ADMIN.
pub const RECV_BUFFER_BYTES: usize = 16 * 1024 * 1024;

// =======================================================================
// Bind adapters
// =======================================================================

/// Consecutive lazy-init failures before an adapter enters permanent no-op.
pub const MAX_INIT_RETRIES: u32 = 3;
