// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! # rill — runtime substrate for fixed-rate streaming dataflow
//!
//! rill provides the mechanisms that let many independently-clocked
//! signal-processing tasks run on one host, exchange fixed-rate sample
//! streams, observe one another live, and degrade predictably when
//! producers outrun consumers or the OS fails to schedule on time.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                      Compiled program shell                        |
//! |   descriptor tables | CLI | signal/duration | stats report         |
//! +--------------------------------------------------------------------+
//! |                          Task threads                              |
//! |   Tick (sleep+spin schedule) -> actor chain -> TaskStats           |
//! +--------------------------------------------------------------------+
//! |                        Stream plumbing                             |
//! |   RingBuffer / SpscRing (in-process)                               |
//! |   DatagramBind -> PPKT datagrams (UDP / unix dgram)                |
//! |   ShmBind     -> PSHM shared-memory ring (same host)               |
//! +--------------------------------------------------------------------+
//! |                        Receiver stack                              |
//! |   PpktReceiver (frame assembly) | ShmReceiver | SampleStore        |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`ring::RingBuffer`] | Lock-free single-writer, N-reader sample queue |
//! | [`tick::Tick`] | Periodic tick generator with adaptive spin |
//! | [`net::PpktHeader`] | 48-byte datagram wire header |
//! | [`shm::ShmWriter`] / [`shm::ShmReader`] | Cross-process PSHM ring |
//! | [`bind::DatagramBind`] / [`bind::ShmBind`] | Per-endpoint I/O adapters |
//! | [`receiver::PpktReceiver`] | Frame-assembling datagram receiver |
//! | [`shell::shell_main`] | Descriptor-driven program orchestration |
//!
//! Transports are best-effort by design: non-blocking sends drop silently
//! under contention, readers that fall behind fast-forward, and every
//! integrity fault is a counter rather than an error on the data path.

pub mod bind;
pub mod config;
pub mod net;
pub mod receiver;
pub mod ring;
pub mod rt;
pub mod shell;
pub mod shm;
pub mod tick;

pub use net::{DType, PpktHeader};
pub use ring::{RingBuffer, SpscRing};
pub use tick::{SpinMode, TaskStats, Tick};
