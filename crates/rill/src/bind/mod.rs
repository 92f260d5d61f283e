// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Bind endpoints — named I/O attachment points for compiled pipelines.
//!
//! A *bind* is a named edge of the dataflow graph that crosses the
//! process boundary: an actor sends to or receives from it through an
//! adapter ([`DatagramBind`] or [`ShmBind`]) instead of an in-process
//! ring. The transport is selected at compile time per bind; no dynamic
//! dispatch sits on the data path.
//!
//! Adapters are deliberately forgiving: they initialize lazily on first
//! I/O, retry a bounded number of times, and collapse into a permanent
//! no-op rather than failing the pipeline. An actor keeps firing whether
//! or not anyone is listening.
//!
//! The shell owns one [`BindState`] per bind and rewrites its endpoint
//! on rebind requests; adapters re-read it when they (re)initialize.

mod datagram;
mod shm;

pub use datagram::{DatagramBind, DatagramTransport};
pub use shm::ShmBind;

use parking_lot::Mutex;

/// I/O direction of a bind, fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Pipeline output: the adapter sends.
    Out,
    /// Pipeline input: the adapter receives.
    In,
}

/// Shared endpoint cell for one bind. Owned by the program shell; the
/// shell is the only writer, adapters read it under the lock when they
/// initialize or reconnect.
#[derive(Debug, Default)]
pub struct BindState {
    endpoint: Mutex<String>,
}

impl BindState {
    /// New state with an initial endpoint (may be empty = unbound).
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: Mutex::new(endpoint.to_string()),
        }
    }

    /// Current endpoint string.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.endpoint.lock().clone()
    }

    /// Replace the endpoint (shell side of a rebind).
    pub fn set_endpoint(&self, endpoint: &str) {
        *self.endpoint.lock() = endpoint.to_string();
    }
}

/// Extract the raw address from a spec-style or raw endpoint string.
///
///   - Spec string: `udp("127.0.0.1:9100", chan=10)` → `127.0.0.1:9100`
///   - Raw address: `127.0.0.1:9100` → unchanged
///   - Empty: `""` → `""`
#[must_use]
pub fn extract_address(ep: &str) -> String {
    if let Some(q1) = ep.find('"') {
        if let Some(q2) = ep[q1 + 1..].find('"') {
            return ep[q1 + 1..q1 + 1 + q2].to_string();
        }
    }
    ep.to_string()
}
