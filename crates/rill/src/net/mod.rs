// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! PPKT wire protocol and non-blocking datagram transport.
//!
//! The PPKT format streams fixed-rate sample data between processes as
//! self-contained datagrams: a 48-byte little-endian header followed by
//! raw sample payload. Transport is best-effort by design — a send the
//! kernel would block on is a silent drop, and the receive side exposes
//! "no data" as a normal zero return.

mod addr;
mod datagram;
mod ppkt;

pub use addr::{parse_endpoint, Endpoint};
pub use datagram::{send_chunked, DatagramReceiver, DatagramSender};
pub use ppkt::{
    ppkt_validate, DType, PpktHeader, FLAG_FIRST_FRAME, FLAG_FRAME_END, FLAG_FRAME_START,
    PPKT_HEADER_LEN, PPKT_MAGIC, PPKT_VERSION,
};
