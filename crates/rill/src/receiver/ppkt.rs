// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! PPKT datagram receiver — socket, receive thread, drain loop.
//!
//! The receive thread waits for readiness with a 1 ms poll timeout (so
//! a stop request is observed promptly) and then drains the socket
//! completely before polling again. On Linux the drain uses
//! `recvmmsg` in batches of [`RECV_BATCH`] packets; elsewhere it falls
//! back to single receives. Fair-drain holds either way: once the
//! socket signals readable, every queued packet is consumed before the
//! thread returns to the poll.

use super::assemble::{ChannelTable, FrameAssembler};
use super::{ChannelSnapshot, ReceiverMetrics};
use crate::config::{
    DEFAULT_STORE_CAPACITY, MAX_PACKET_BYTES, POLL_TIMEOUT_MS, RECV_BATCH, RECV_BUFFER_BYTES,
};
use crate::net::DatagramReceiver;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const SOCKET_TOKEN: Token = Token(0);

#[derive(Default)]
struct Counters {
    recv_packets: AtomicU64,
    recv_bytes: AtomicU64,
}

/// Multi-channel PPKT receiver with frame assembly.
///
/// Binds a datagram endpoint, spawns a receive thread, and exposes
/// thread-safe channel snapshots while it runs.
pub struct PpktReceiver {
    table: Arc<ChannelTable>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    /// Asks the receive thread to forget its pending-frame state.
    recv_state_reset: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    buffer_capacity: usize,
}

impl PpktReceiver {
    /// New receiver with the default per-channel store capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STORE_CAPACITY)
    }

    /// New receiver whose channels hold `buffer_capacity` samples each.
    #[must_use]
    pub fn with_capacity(buffer_capacity: usize) -> Self {
        Self {
            table: Arc::new(ChannelTable::new(buffer_capacity)),
            counters: Arc::new(Counters::default()),
            running: Arc::new(AtomicBool::new(false)),
            recv_state_reset: Arc::new(AtomicBool::new(false)),
            thread: None,
            buffer_capacity,
        }
    }

    /// Bind a UDP port on all interfaces and start the receive thread.
    pub fn start_port(&mut self, port: u16) -> io::Result<()> {
        self.start(&format!("0.0.0.0:{port}"))
    }

    /// Bind `address` (`host:port` or `unix:///path`) and start the
    /// receive thread. The receiver must be stopped.
    pub fn start(&mut self, address: &str) -> io::Result<()> {
        if self.thread.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "receiver already running",
            ));
        }

        let receiver = DatagramReceiver::bind(address)?;
        receiver.request_recv_buffer(RECV_BUFFER_BYTES);

        self.running.store(true, Ordering::Release);
        let table = Arc::clone(&self.table);
        let counters = Arc::clone(&self.counters);
        let running = Arc::clone(&self.running);
        let reset = Arc::clone(&self.recv_state_reset);
        let label = address.to_string();

        self.thread = Some(std::thread::spawn(move || {
            if let Err(e) = recv_loop(&receiver, &table, &counters, &running, &reset) {
                log::error!("[RECV] '{label}': receive loop failed: {e}");
            }
        }));
        Ok(())
    }

    /// Stop the receive thread and close the socket.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Whether the receive thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Per-channel store capacity.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Snapshot all channels for rendering.
    #[must_use]
    pub fn snapshot(&self, max_samples: usize) -> Vec<ChannelSnapshot> {
        self.table.snapshot(max_samples)
    }

    /// Fill a caller-owned snapshot vector, reusing its allocations.
    pub fn snapshot_into(&self, out: &mut Vec<ChannelSnapshot>, max_samples: usize) {
        self.table.snapshot_into(out, max_samples);
    }

    /// Drop all channel data (monitor reconnect). The receive thread
    /// also forgets any half-assembled frames.
    pub fn clear_channels(&self) {
        self.table.clear();
        self.recv_state_reset.store(true, Ordering::Release);
    }

    /// Lock-free packet/byte counters.
    #[must_use]
    pub fn metrics(&self) -> ReceiverMetrics {
        ReceiverMetrics {
            recv_packets: self.counters.recv_packets.load(Ordering::Relaxed),
            recv_bytes: self.counters.recv_bytes.load(Ordering::Relaxed),
        }
    }

    /// The shared channel table (for embedding in a larger monitor).
    #[must_use]
    pub fn table(&self) -> Arc<ChannelTable> {
        Arc::clone(&self.table)
    }
}

impl Default for PpktReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PpktReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn recv_loop(
    receiver: &DatagramReceiver,
    table: &ChannelTable,
    counters: &Counters,
    running: &AtomicBool,
    reset: &AtomicBool,
) -> io::Result<()> {
    let mut assembler = FrameAssembler::new();

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(16);
    let fd = receiver.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&fd), SOCKET_TOKEN, Interest::READABLE)?;

    let mut drain = DrainBuffers::new();

    while running.load(Ordering::Acquire) {
        if reset.swap(false, Ordering::AcqRel) {
            assembler.reset();
        }

        match poll.poll(&mut events, Some(Duration::from_millis(POLL_TIMEOUT_MS))) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if events.is_empty() {
            continue; // timeout: re-check running
        }

        // Fair drain: consume everything queued before polling again.
        loop {
            let received = drain.recv_batch(receiver);
            if received.is_empty() {
                break;
            }
            for (buf_idx, len) in received {
                counters.recv_packets.fetch_add(1, Ordering::Relaxed);
                counters.recv_bytes.fetch_add(len as u64, Ordering::Relaxed);
                assembler.process_packet(drain.packet(buf_idx, len), table);
            }
        }
    }
    Ok(())
}

/// Batch receive buffers. On Linux a whole batch arrives per
/// `recvmmsg`; elsewhere one packet per call.
struct DrainBuffers {
    bufs: Vec<[u8; MAX_PACKET_BYTES]>,
}

impl DrainBuffers {
    fn new() -> Self {
        Self {
            bufs: vec![[0u8; MAX_PACKET_BYTES]; RECV_BATCH],
        }
    }

    fn packet(&self, idx: usize, len: usize) -> &[u8] {
        &self.bufs[idx][..len]
    }

    /// Receive up to [`RECV_BATCH`] packets without blocking. Returns
    /// `(buffer_index, length)` pairs; empty means the socket is dry.
    #[cfg(target_os = "linux")]
    fn recv_batch(&mut self, receiver: &DatagramReceiver) -> Vec<(usize, usize)> {
        let fd = receiver.as_raw_fd();

        // SAFETY: iovecs and msghdrs are built fresh over self.bufs,
        // which outlives the recvmmsg call; counts match RECV_BATCH.
        unsafe {
            let mut iovecs: Vec<libc::iovec> = self
                .bufs
                .iter_mut()
                .map(|b| libc::iovec {
                    iov_base: b.as_mut_ptr().cast(),
                    iov_len: MAX_PACKET_BYTES,
                })
                .collect();
            let mut msgs: Vec<libc::mmsghdr> = iovecs
                .iter_mut()
                .map(|iov| {
                    let mut msg: libc::mmsghdr = std::mem::zeroed();
                    msg.msg_hdr.msg_iov = iov;
                    msg.msg_hdr.msg_iovlen = 1;
                    msg
                })
                .collect();

            let n = libc::recvmmsg(
                fd,
                msgs.as_mut_ptr(),
                RECV_BATCH as libc::c_uint,
                libc::MSG_DONTWAIT,
                std::ptr::null_mut(),
            );
            if n <= 0 {
                return Vec::new();
            }
            (0..n as usize)
                .map(|i| (i, msgs[i].msg_len as usize))
                .collect()
        }
    }

    /// Single-receive fallback for non-Linux hosts.
    #[cfg(not(target_os = "linux"))]
    fn recv_batch(&mut self, receiver: &DatagramReceiver) -> Vec<(usize, usize)> {
        match receiver.recv(&mut self.bufs[0]) {
            Ok(0) | Err(_) => Vec::new(),
            Ok(n) => vec![(0, n)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{
        send_chunked, DType, DatagramSender, PpktHeader, FLAG_FIRST_FRAME, PPKT_HEADER_LEN,
    };

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..500 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn receives_and_assembles_chunked_stream() {
        let port = 39_615u16;
        let mut rx = PpktReceiver::with_capacity(4096);
        rx.start_port(port).expect("start");
        assert!(rx.is_running());

        let sender = DatagramSender::open(&format!("127.0.0.1:{port}")).expect("open");
        let mut hdr = PpktHeader::new(DType::F32, 2);
        hdr.flags = FLAG_FIRST_FRAME;
        hdr.sample_rate_hz = 1000.0;
        hdr.timestamp_ns = 42;

        // 20 samples at 8 samples/packet -> 3 chunks, one frame.
        let data: Vec<u8> = (0..20u32)
            .flat_map(|i| (i as f32).to_le_bytes())
            .collect();
        let sent = send_chunked(&sender, &mut hdr, &data, PPKT_HEADER_LEN + 32);
        assert_eq!(sent, 3);

        assert!(wait_for(|| rx.metrics().recv_packets >= 3));
        assert!(wait_for(|| rx
            .snapshot(64)
            .first()
            .is_some_and(|s| s.stats.accepted_frames == 1)));

        let snaps = rx.snapshot(64);
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].chan_id, 2);
        assert_eq!(snaps[0].samples.len(), 20);
        assert_eq!(snaps[0].samples[19], 19.0);
        assert_eq!(snaps[0].sample_rate_hz, 1000.0);

        rx.stop();
        assert!(!rx.is_running());
    }

    #[test]
    fn clear_channels_drops_state() {
        let port = 39_617u16;
        let mut rx = PpktReceiver::with_capacity(1024);
        rx.start_port(port).expect("start");

        let sender = DatagramSender::open(&format!("127.0.0.1:{port}")).expect("open");
        let mut hdr = PpktHeader::new(DType::F32, 1);
        hdr.flags = FLAG_FIRST_FRAME;
        let data: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        send_chunked(&sender, &mut hdr, &data, 1472);

        assert!(wait_for(|| !rx.snapshot(16).is_empty()));
        rx.clear_channels();
        assert!(rx.snapshot(16).is_empty());
        rx.stop();
    }

    #[test]
    fn start_twice_is_an_error() {
        let mut rx = PpktReceiver::with_capacity(64);
        rx.start_port(39_619).expect("start");
        assert!(rx.start_port(39_620).is_err());
        rx.stop();
    }

    #[test]
    fn bad_address_fails_fast() {
        let mut rx = PpktReceiver::with_capacity(64);
        assert!(rx.start("not-an-address").is_err());
        assert!(!rx.is_running());
    }
}
