// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Datagram bind adapter — PPKT send/recv for bind-backed buffers.

use super::{extract_address, BindState, Direction};
use crate::config::{MAX_INIT_RETRIES, MAX_PACKET_BYTES, PPKT_DEFAULT_MTU};
use crate::net::{
    ppkt_validate, send_chunked, DType, DatagramReceiver, DatagramSender, PpktHeader,
    FLAG_FIRST_FRAME, PPKT_HEADER_LEN,
};
use crate::rt;
use parking_lot::Mutex;
use std::sync::Arc;

/// Underlying socket family for a datagram bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramTransport {
    Udp,
    /// Unix-domain datagram; raw endpoint paths get the `unix://` scheme
    /// prepended automatically.
    UnixDgram,
}

struct Inner {
    sender: Option<DatagramSender>,
    receiver: Option<DatagramReceiver>,
    hdr: PpktHeader,
    initialized: bool,
    init_fail_count: u32,
    endpoint: String,
    recv_buf: Box<[u8; MAX_PACKET_BYTES]>,
}

/// Per-bind datagram adapter: lazy connect, bounded retry, thread-safe
/// reconnect, zero-fill on absent data.
///
/// All public methods hold the adapter's I/O mutex end-to-end, so
/// concurrent callers serialize per adapter. Adapters are independent of
/// one another.
pub struct DatagramBind {
    name: String,
    dtype: DType,
    rate_hz: f64,
    direction: Direction,
    transport: DatagramTransport,
    state: Arc<BindState>,
    inner: Mutex<Inner>,
}

impl DatagramBind {
    /// Create an adapter for a named bind. No I/O happens until the
    /// first `send`/`recv`.
    #[must_use]
    pub fn new(
        name: &str,
        direction: Direction,
        dtype: DType,
        chan_id: u16,
        rate_hz: f64,
        transport: DatagramTransport,
        state: Arc<BindState>,
    ) -> Self {
        let mut hdr = PpktHeader::new(dtype, chan_id);
        hdr.flags = FLAG_FIRST_FRAME;
        Self {
            name: name.to_string(),
            dtype,
            rate_hz,
            direction,
            transport,
            state,
            inner: Mutex::new(Inner {
                sender: None,
                receiver: None,
                hdr,
                initialized: false,
                init_fail_count: 0,
                endpoint: String::new(),
                recv_buf: Box::new([0u8; MAX_PACKET_BYTES]),
            }),
        }
    }

    /// Send `n_tokens` samples (raw bytes of the bind's dtype) as one or
    /// more PPKT datagrams. Silently does nothing when the transport is
    /// absent or still failing to initialize.
    pub fn send(&self, data: &[u8], n_tokens: u32) {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            self.lazy_init(&mut inner);
        }
        let Inner { sender, hdr, .. } = &mut *inner;
        let Some(sender) = sender else {
            return;
        };

        let payload_bytes = (n_tokens as usize * self.dtype.size()).min(data.len());
        let rate = rt::task_rate_hz();
        hdr.sample_rate_hz = if rate > 0.0 { rate } else { self.rate_hz };
        hdr.timestamp_ns = rt::now_ns();
        hdr.iteration_index = rt::iteration_index();

        send_chunked(sender, hdr, &data[..payload_bytes], PPKT_DEFAULT_MTU);
        hdr.sequence = hdr.sequence.wrapping_add(1);
        hdr.flags &= !FLAG_FIRST_FRAME;
    }

    /// Receive into `out`, zero-filling first so the caller always sees
    /// defined bytes. Drains every queued datagram and keeps the newest
    /// valid one (a fixed-rate consumer wants the freshest frame, not a
    /// backlog).
    pub fn recv(&self, out: &mut [u8], n_tokens: u32) {
        let mut inner = self.inner.lock();
        let fill_bytes = (n_tokens as usize * self.dtype.size()).min(out.len());
        out[..fill_bytes].fill(0);

        if !inner.initialized {
            self.lazy_init(&mut inner);
        }
        let Inner {
            receiver, recv_buf, ..
        } = &mut *inner;
        let Some(receiver) = receiver else {
            return;
        };

        let mut latest_len = 0usize;
        loop {
            match receiver.recv(recv_buf.as_mut_slice()) {
                Ok(0) | Err(_) => break,
                Ok(n) => latest_len = n,
            }
        }

        if latest_len < PPKT_HEADER_LEN {
            return;
        }
        let pkt = &recv_buf[..latest_len];
        if !ppkt_validate(pkt) {
            return;
        }
        let Some(hdr) = PpktHeader::decode(pkt) else {
            return;
        };
        if hdr.dtype != self.dtype as u8 {
            return;
        }

        let available = (hdr.payload_bytes as usize).min(latest_len - PPKT_HEADER_LEN);
        let copy_bytes = available.min(fill_bytes);
        out[..copy_bytes].copy_from_slice(&recv_buf[PPKT_HEADER_LEN..PPKT_HEADER_LEN + copy_bytes]);
    }

    /// Tear down the transport and adopt a new endpoint; the next I/O
    /// call re-initializes. An empty endpoint disconnects (no-op mode).
    pub fn reconnect(&self, new_endpoint: &str) {
        let mut inner = self.inner.lock();
        inner.sender = None;
        inner.receiver = None;
        inner.endpoint = self.resolve_address(&extract_address(new_endpoint));
        inner.initialized = false;
        inner.init_fail_count = 0;
    }

    fn lazy_init(&self, inner: &mut Inner) {
        if inner.init_fail_count >= MAX_INIT_RETRIES {
            return; // permanent no-op, already reported
        }

        let ep = self.state.endpoint();
        inner.endpoint = self.resolve_address(&extract_address(&ep));

        if inner.endpoint.is_empty() {
            inner.initialized = true; // intentionally unbound
            return;
        }

        let result = match self.direction {
            Direction::Out => DatagramSender::open(&inner.endpoint).map(|s| {
                inner.sender = Some(s);
            }),
            Direction::In => DatagramReceiver::bind(&inner.endpoint).map(|r| {
                inner.receiver = Some(r);
            }),
        };

        match result {
            Ok(()) => inner.initialized = true,
            Err(e) => {
                inner.init_fail_count += 1;
                log::warn!(
                    "[BIND] '{}': failed to open endpoint '{}' (attempt {}/{}): {e}",
                    self.name,
                    inner.endpoint,
                    inner.init_fail_count,
                    MAX_INIT_RETRIES
                );
                if inner.init_fail_count >= MAX_INIT_RETRIES {
                    log::warn!(
                        "[BIND] '{}': giving up after {MAX_INIT_RETRIES} attempts",
                        self.name
                    );
                    inner.initialized = true; // permanent no-op
                }
            }
        }
    }

    fn resolve_address(&self, raw: &str) -> String {
        if self.transport == DatagramTransport::UnixDgram
            && !raw.is_empty()
            && !raw.starts_with("unix://")
        {
            return format!("unix://{raw}");
        }
        raw.to_string()
    }
}
