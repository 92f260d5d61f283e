// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Non-blocking datagram endpoints and the MTU-chunked PPKT send path.
//!
//! Senders are connected sockets: the destination is resolved once at
//! open and `send` is a single syscall. A send the kernel would block on
//! is a silent drop — the data path never retries and never logs.

use super::addr::{parse_endpoint, Endpoint};
use super::ppkt::{DType, PpktHeader, FLAG_FRAME_END, FLAG_FRAME_START, PPKT_HEADER_LEN};
use crate::config::MAX_PACKET_BYTES;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

enum SenderSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

/// Connected, non-blocking datagram sender (UDP or Unix-domain).
pub struct DatagramSender {
    inner: SenderSocket,
}

impl DatagramSender {
    /// Open and connect to `addr` (`host:port` or `unix:///path`).
    ///
    /// # Errors
    ///
    /// Address parse failures and socket/connect errors. For Unix-domain
    /// endpoints, connect fails until the receiving socket exists.
    pub fn open(addr: &str) -> io::Result<Self> {
        match parse_endpoint(addr)? {
            Endpoint::Inet(sa) => {
                let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
                socket.set_nonblocking(true)?;
                if let Err(e) = socket.connect(&SocketAddr::V4(sa).into()) {
                    log::debug!("[NET] sender connect failed dest={sa}: {e}");
                    return Err(e);
                }
                log::debug!("[NET] sender connected udp dest={sa}");
                Ok(Self {
                    inner: SenderSocket::Udp(socket.into()),
                })
            }
            Endpoint::Unix(path) => {
                let socket = UnixDatagram::unbound()?;
                socket.set_nonblocking(true)?;
                if let Err(e) = socket.connect(&path) {
                    log::debug!(
                        "[NET] sender connect failed dest={}: {e}",
                        path.display()
                    );
                    return Err(e);
                }
                log::debug!("[NET] sender connected unix dest={}", path.display());
                Ok(Self {
                    inner: SenderSocket::Unix(socket),
                })
            }
        }
    }

    /// Send one datagram. Returns `true` iff the OS accepted it; a
    /// would-block condition is a silent drop (best-effort contract).
    pub fn send(&self, data: &[u8]) -> bool {
        let result = match &self.inner {
            SenderSocket::Udp(s) => s.send(data),
            SenderSocket::Unix(s) => s.send(data),
        };
        result.is_ok()
    }
}

enum ReceiverSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

/// Bound, non-blocking datagram receiver (UDP or Unix-domain).
pub struct DatagramReceiver {
    inner: ReceiverSocket,
}

impl DatagramReceiver {
    /// Bind to `addr` (`host:port` or `unix:///path`).
    ///
    /// UDP sockets get `SO_REUSEADDR` so a monitor can rebind a recently
    /// closed port without waiting out the kernel.
    ///
    /// # Errors
    ///
    /// Address parse failures and socket/bind errors.
    pub fn bind(addr: &str) -> io::Result<Self> {
        match parse_endpoint(addr)? {
            Endpoint::Inet(sa) => {
                let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
                socket.set_reuse_address(true)?;
                socket.set_nonblocking(true)?;
                if let Err(e) = socket.bind(&SocketAddr::V4(sa).into()) {
                    log::debug!("[NET] receiver bind failed addr={sa}: {e}");
                    return Err(e);
                }
                log::debug!("[NET] receiver bound udp addr={sa}");
                Ok(Self {
                    inner: ReceiverSocket::Udp(socket.into()),
                })
            }
            Endpoint::Unix(path) => {
                let socket = match UnixDatagram::bind(&path) {
                    Ok(socket) => socket,
                    Err(e) => {
                        log::debug!(
                            "[NET] receiver bind failed addr={}: {e}",
                            path.display()
                        );
                        return Err(e);
                    }
                };
                socket.set_nonblocking(true)?;
                log::debug!("[NET] receiver bound unix addr={}", path.display());
                Ok(Self {
                    inner: ReceiverSocket::Unix(socket),
                })
            }
        }
    }

    /// Receive one datagram into `buf`.
    ///
    /// Returns `Ok(0)` when no datagram is queued (not an error on a
    /// non-blocking socket).
    ///
    /// # Errors
    ///
    /// Real socket errors only; would-block is `Ok(0)`.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let result = match &self.inner {
            ReceiverSocket::Udp(s) => s.recv(buf),
            ReceiverSocket::Unix(s) => s.recv(buf),
        };
        match result {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Ask the kernel for a larger receive buffer to absorb bursts.
    ///
    /// Tries `SO_RCVBUFFORCE` first (needs CAP_NET_ADMIN, bypasses
    /// `rmem_max`), then falls back to plain `SO_RCVBUF`, which the
    /// kernel silently caps. Never fails: an undersized buffer just
    /// means more kernel-level drops, which the frame stats surface.
    pub fn request_recv_buffer(&self, bytes: usize) {
        let fd = self.as_raw_fd();
        let val = bytes as libc::c_int;
        let len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: setsockopt with a valid fd, standard option names, and
        // a correctly-sized option value on this stack frame.
        unsafe {
            #[cfg(target_os = "linux")]
            let forced = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUFFORCE,
                std::ptr::addr_of!(val).cast(),
                len,
            ) == 0;
            #[cfg(not(target_os = "linux"))]
            let forced = false;

            if !forced {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    std::ptr::addr_of!(val).cast(),
                    len,
                );
            }
        }
    }

    /// Local address of a UDP receiver (`None` for Unix sockets).
    pub fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
        match &self.inner {
            ReceiverSocket::Udp(s) => s.local_addr().map(Some),
            ReceiverSocket::Unix(_) => Ok(None),
        }
    }
}

impl AsRawFd for DatagramReceiver {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            ReceiverSocket::Udp(s) => s.as_raw_fd(),
            ReceiverSocket::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// Send `data` (raw sample bytes of the header's dtype) as one or more
/// PPKT packets, splitting at `mtu`.
///
/// For chunk k at sample offset o: `sample_count = min(remaining,
/// max_samples_per_mtu)`, `iteration_index = base + o`, `sequence =
/// base_seq + k`. The first chunk carries [`FLAG_FRAME_START`], the last
/// [`FLAG_FRAME_END`] (a single-packet frame carries both); any
/// `FLAG_FIRST_FRAME` bit already on the header is preserved on every
/// chunk.
///
/// On return `hdr.sequence` is the next available sequence number.
/// Returns the number of packets the OS accepted.
pub fn send_chunked(
    sender: &DatagramSender,
    hdr: &mut PpktHeader,
    data: &[u8],
    mtu: usize,
) -> u32 {
    let Some(dtype) = DType::from_code(hdr.dtype) else {
        return 0;
    };
    let dsz = dtype.size();
    if mtu <= PPKT_HEADER_LEN || mtu > MAX_PACKET_BYTES {
        return 0;
    }
    let max_samples = ((mtu - PPKT_HEADER_LEN) / dsz) as u32;
    if max_samples == 0 {
        return 0;
    }

    let total = (data.len() / dsz) as u32;
    let base_iter = hdr.iteration_index;
    let carried_flags = hdr.flags & !(FLAG_FRAME_START | FLAG_FRAME_END);

    let mut pkt = [0u8; MAX_PACKET_BYTES];
    let mut packets_sent = 0u32;
    let mut offset = 0u32;

    while offset < total {
        let chunk = (total - offset).min(max_samples);
        hdr.sample_count = chunk;
        hdr.payload_bytes = chunk * dsz as u32;
        hdr.iteration_index = base_iter + u64::from(offset);
        hdr.flags = carried_flags;
        if offset == 0 {
            hdr.flags |= FLAG_FRAME_START;
        }
        if offset + chunk == total {
            hdr.flags |= FLAG_FRAME_END;
        }

        let payload_bytes = hdr.payload_bytes as usize;
        let pkt_size = PPKT_HEADER_LEN + payload_bytes;
        pkt[..PPKT_HEADER_LEN].copy_from_slice(&hdr.encode());
        let src_off = offset as usize * dsz;
        pkt[PPKT_HEADER_LEN..pkt_size].copy_from_slice(&data[src_off..src_off + payload_bytes]);

        if sender.send(&pkt[..pkt_size]) {
            packets_sent += 1;
        }

        hdr.sequence = hdr.sequence.wrapping_add(1);
        offset += chunk;
    }

    packets_sent
}
