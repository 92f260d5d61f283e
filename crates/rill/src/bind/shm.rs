// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! Shared-memory bind adapter — PSHM publish/consume for bind-backed
//! buffers.
//!
//! Ring geometry (`slots`, `slot_bytes`) is burned into the compiled
//! program: a rebind may move the adapter to a different endpoint name
//! but never to a different geometry. Rejected rebinds leave the current
//! attachment untouched.

use super::{BindState, Direction};
use crate::config::MAX_INIT_RETRIES;
use crate::net::DType;
use crate::rt;
use crate::shm::{
    parse_shm_endpoint, ShmReader, ShmWriter, StreamContract, FLAG_FRAME_END, FLAG_FRAME_START,
};
use parking_lot::Mutex;
use std::sync::Arc;

struct Inner {
    writer: Option<ShmWriter>,
    reader: Option<ShmReader>,
    initialized: bool,
    init_fail_count: u32,
    endpoint: String,
}

/// Per-bind PSHM adapter: lazy attach, bounded retry, geometry-gated
/// rebind, zero-fill on absent data.
///
/// All public methods hold the adapter's I/O mutex end-to-end.
pub struct ShmBind {
    name: String,
    direction: Direction,
    dtype: DType,
    slots: u32,
    slot_bytes: u32,
    contract: StreamContract,
    state: Arc<BindState>,
    inner: Mutex<Inner>,
}

impl ShmBind {
    /// Create an adapter for a named shared-memory bind. No shared
    /// memory is touched until the first `send`/`recv`.
    #[must_use]
    pub fn new(
        name: &str,
        direction: Direction,
        slots: u32,
        slot_bytes: u32,
        contract: StreamContract,
        state: Arc<BindState>,
    ) -> Self {
        Self {
            name: name.to_string(),
            direction,
            dtype: contract.dtype,
            slots,
            slot_bytes,
            contract,
            state,
            inner: Mutex::new(Inner {
                writer: None,
                reader: None,
                initialized: false,
                init_fail_count: 0,
                endpoint: String::new(),
            }),
        }
    }

    /// Publish `n_tokens` samples (raw bytes of the bind's dtype) as one
    /// frame-complete slot. Silently does nothing when unattached.
    pub fn send(&self, data: &[u8], n_tokens: u32) {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            self.lazy_init(&mut inner);
        }
        let Some(writer) = inner.writer.as_mut() else {
            return;
        };

        let payload_bytes = (n_tokens as usize * self.dtype.size()).min(data.len());
        writer.publish(
            &data[..payload_bytes],
            n_tokens,
            FLAG_FRAME_START | FLAG_FRAME_END,
            rt::iteration_index(),
        );
    }

    /// Consume the next slot into `out`, zero-filling first so callers
    /// always see defined bytes. A miss (no data, fence, resync) leaves
    /// the zero fill in place.
    pub fn recv(&self, out: &mut [u8], n_tokens: u32) {
        let mut inner = self.inner.lock();
        let fill_bytes = (n_tokens as usize * self.dtype.size()).min(out.len());
        out[..fill_bytes].fill(0);

        if !inner.initialized {
            self.lazy_init(&mut inner);
        }
        let Some(reader) = inner.reader.as_mut() else {
            return;
        };

        reader.consume(&mut out[..fill_bytes]);
    }

    /// Validate geometry and reconnect to a new endpoint.
    ///
    /// Returns `false` (keeping the current attachment) when the new
    /// endpoint declares a different geometry than this adapter was
    /// compiled with. An empty endpoint disconnects into no-op mode. On
    /// the outgoing side an epoch fence is emitted first so readers of
    /// the old ring resynchronize instead of splicing streams.
    pub fn try_reconnect(&self, new_endpoint: &str) -> bool {
        let mut inner = self.inner.lock();

        if new_endpoint.is_empty() {
            inner.writer = None;
            inner.reader = None;
            inner.endpoint.clear();
            inner.initialized = true; // intentional no-op
            return true;
        }

        let parsed = parse_shm_endpoint(new_endpoint);
        if let Some(slots) = parsed.slots {
            if slots != self.slots {
                log::error!(
                    "[BIND] shm '{}': rejecting rebind, slots mismatch (compiled={}, endpoint={slots})",
                    self.name,
                    self.slots
                );
                return false;
            }
        }
        if let Some(slot_bytes) = parsed.slot_bytes {
            if slot_bytes != self.slot_bytes {
                log::error!(
                    "[BIND] shm '{}': rejecting rebind, slot_bytes mismatch (compiled={}, endpoint={slot_bytes})",
                    self.name,
                    self.slot_bytes
                );
                return false;
            }
        }

        // Fence the outgoing stream before abandoning it.
        if self.direction == Direction::Out {
            if let Some(writer) = inner.writer.as_mut() {
                writer.emit_epoch_fence(rt::iteration_index());
            }
        }

        inner.writer = None;
        inner.reader = None;
        inner.endpoint = parsed.name;
        inner.initialized = false;
        inner.init_fail_count = 0;
        self.lazy_init(&mut inner);
        true
    }

    fn lazy_init(&self, inner: &mut Inner) {
        if inner.init_fail_count >= MAX_INIT_RETRIES {
            return; // permanent no-op, already reported
        }

        let parsed = parse_shm_endpoint(&self.state.endpoint());
        inner.endpoint = parsed.name;

        if inner.endpoint.is_empty() {
            inner.initialized = true; // intentionally unbound
            return;
        }

        let result = match self.direction {
            Direction::Out => {
                ShmWriter::create(&inner.endpoint, self.slots, self.slot_bytes, &self.contract)
                    .map(|w| inner.writer = Some(w))
            }
            Direction::In => {
                ShmReader::attach(&inner.endpoint, self.slots, self.slot_bytes, &self.contract)
                    .map(|r| inner.reader = Some(r))
            }
        };

        match result {
            Ok(()) => inner.initialized = true,
            Err(e) => {
                inner.init_fail_count += 1;
                log::warn!(
                    "[BIND] shm '{}': failed to open '{}' (attempt {}/{}): {e}",
                    self.name,
                    inner.endpoint,
                    inner.init_fail_count,
                    MAX_INIT_RETRIES
                );
                if inner.init_fail_count >= MAX_INIT_RETRIES {
                    log::warn!(
                        "[BIND] shm '{}': giving up after {MAX_INIT_RETRIES} attempts",
                        self.name
                    );
                    inner.initialized = true; // permanent no-op
                }
            }
        }
    }
}
