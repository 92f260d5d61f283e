// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Endpoint address parsing.
//!
//! Two formats:
//!   - `host:port` — UDP over IPv4. `host` is `localhost` or a
//!     dotted-quad; `port` in [1, 65535].
//!   - `unix:///absolute/path` — Unix-domain datagram socket.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

/// Longest Unix socket path the kernel accepts (`sun_path`, including the
/// trailing NUL).
const MAX_UNIX_PATH: usize = 107;

/// A parsed datagram endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// IPv4 UDP address.
    Inet(SocketAddrV4),
    /// Unix-domain datagram socket path.
    Unix(PathBuf),
}

/// Parse an endpoint address string.
///
/// # Errors
///
/// `InvalidInput` when the string matches neither format, the port is out
/// of range, or a Unix path exceeds the kernel's `sun_path` limit.
pub fn parse_endpoint(addr: &str) -> io::Result<Endpoint> {
    if let Some(path) = addr.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(invalid(addr, "empty unix socket path"));
        }
        if path.len() > MAX_UNIX_PATH {
            return Err(invalid(addr, "unix socket path too long"));
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }

    // "host:port" — split on the last colon so a stray colon in the host
    // part fails parsing rather than shifting the port.
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        return Err(invalid(addr, "expected host:port or unix:///path"));
    };
    if host.is_empty() {
        return Err(invalid(addr, "missing host"));
    }

    let port: u16 = port_str
        .parse()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| invalid(addr, "port must be in [1, 65535]"))?;

    let ip = if host == "localhost" {
        Ipv4Addr::LOCALHOST
    } else {
        host.parse::<Ipv4Addr>()
            .map_err(|_| invalid(addr, "host must be 'localhost' or a dotted-quad"))?
    };

    Ok(Endpoint::Inet(SocketAddrV4::new(ip, port)))
}

fn invalid(addr: &str, why: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid endpoint '{addr}': {why}"),
    )
}
