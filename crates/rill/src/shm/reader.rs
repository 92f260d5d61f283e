// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! PSHM reader: contract-validated attach and lock-free consume.

use super::layout::{SlotHeader, Superblock, FLAG_EPOCH_FENCE, PSHM_HEADER_LEN, SLOT_HEADER_LEN};
use super::region::ShmRegion;
use super::{normalize_name, region_size, Result, ShmError, StreamContract};
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Reader-side counters. Falling behind and resyncing are normal
/// operating conditions, visible here rather than as errors.
#[derive(Debug, Default)]
pub struct ReaderMetrics {
    /// Slots consumed successfully
    pub consumed: AtomicU64,
    /// Fast-forwards after falling more than `slot_count` behind
    pub fast_forwards: AtomicU64,
    /// Resyncs after a raced overwrite or epoch drift
    pub resyncs: AtomicU64,
    /// Epoch fences crossed
    pub fences: AtomicU64,
}

/// Attach-side consumer of a PSHM ring.
///
/// Multiple readers may attach to one writer; each keeps its own cursor
/// and falls behind independently.
pub struct ShmReader {
    region: ShmRegion,
    slot_count: u32,
    slot_payload_bytes: u32,
    /// Next sequence this reader wants (always >= 1 once attached).
    want_seq: u64,
    known_epoch: u32,
    /// Operational counters.
    pub metrics: ReaderMetrics,
}

impl ShmReader {
    /// Attach to an existing ring and validate the contract.
    ///
    /// Geometry (`slot_count`, `slot_bytes`), dtype, rank and dims must
    /// match exactly. A `stable_id_hash` mismatch is logged but not
    /// fatal: writer and reader are compiled from different programs and
    /// their content hashes naturally differ. Passing 0 skips that check.
    ///
    /// The cursor starts at the newest `slot_count` window so a late
    /// attacher does not replay stale data.
    pub fn attach(
        name: &str,
        expected_slot_count: u32,
        expected_slot_bytes: u32,
        contract: &StreamContract,
    ) -> Result<Self> {
        if expected_slot_bytes % 8 != 0 {
            return Err(ShmError::UnalignedSlotBytes(expected_slot_bytes));
        }

        let normalized = normalize_name(name);
        let total = region_size(expected_slot_count, expected_slot_bytes);
        let region = ShmRegion::open(&normalized, total)?;

        // SAFETY: the region is at least superblock-sized (region_size
        // includes 128 bytes) and page-aligned; all concurrently-written
        // superblock fields are atomics.
        let sb = unsafe { &*region.as_ptr().cast::<Superblock>() };

        if !sb.validate() {
            return Err(ShmError::InvalidLayout(format!(
                "'{normalized}': bad magic/version/header_len"
            )));
        }
        if sb.dtype != contract.dtype as u8 {
            return Err(ShmError::ContractMismatch(format!(
                "'{normalized}': dtype expected {}, got {}",
                contract.dtype as u8, sb.dtype
            )));
        }
        if sb.rank != contract.rank {
            return Err(ShmError::ContractMismatch(format!(
                "'{normalized}': rank expected {}, got {}",
                contract.rank, sb.rank
            )));
        }
        for i in 0..contract.rank as usize {
            if sb.dims[i] != contract.dims[i] {
                return Err(ShmError::ContractMismatch(format!(
                    "'{normalized}': dim[{i}] expected {}, got {}",
                    contract.dims[i], sb.dims[i]
                )));
            }
        }
        if sb.slot_count != expected_slot_count {
            return Err(ShmError::ContractMismatch(format!(
                "'{normalized}': slot_count expected {expected_slot_count}, got {}",
                sb.slot_count
            )));
        }
        if sb.slot_payload_bytes != expected_slot_bytes {
            return Err(ShmError::ContractMismatch(format!(
                "'{normalized}': slot_payload_bytes expected {expected_slot_bytes}, got {}",
                sb.slot_payload_bytes
            )));
        }
        if contract.stable_id_hash != 0 && sb.stable_id_hash != contract.stable_id_hash {
            // Normal for cross-process attach; geometry checks above are
            // what correctness rests on.
            log::warn!(
                "[PSHM] '{normalized}': stable_id_hash mismatch (reader={:#x}, writer={:#x})",
                contract.stable_id_hash,
                sb.stable_id_hash
            );
        }

        let known_epoch = sb.epoch.load(Ordering::Acquire);
        let ws = sb.write_seq.load(Ordering::Acquire);
        let want_seq = if ws > u64::from(expected_slot_count) {
            ws - u64::from(expected_slot_count) + 1
        } else {
            1
        };

        log::debug!("[PSHM] reader attached '{normalized}' at seq {want_seq} epoch {known_epoch}");

        Ok(Self {
            region,
            slot_count: expected_slot_count,
            slot_payload_bytes: expected_slot_bytes,
            want_seq,
            known_epoch,
            metrics: ReaderMetrics::default(),
        })
    }

    /// Consume the next slot's payload into `out`.
    ///
    /// Returns the bytes copied, or 0 for every non-consuming condition:
    /// no new data, a fence crossing, or a resync after overwrite/epoch
    /// drift (distinguishable via [`ShmReader::metrics`], deliberately
    /// not via the return value).
    pub fn consume(&mut self, out: &mut [u8]) -> usize {
        let latest = self.superblock().write_seq.load(Ordering::Acquire);

        // No new data.
        if latest < self.want_seq || self.want_seq == 0 {
            return 0;
        }

        // Fell more than a ring behind: jump to the oldest live slot.
        if latest - self.want_seq >= u64::from(self.slot_count) {
            self.want_seq = latest - u64::from(self.slot_count) + 1;
            self.metrics.fast_forwards.fetch_add(1, Ordering::Relaxed);
        }

        let idx = (self.want_seq % u64::from(self.slot_count)) as u32;
        let slot = self.slot_ptr(idx);
        // SAFETY: idx < slot_count so the pointer is in bounds; all slot
        // header fields are atomics.
        let hdr = unsafe { &*slot };

        // The writer lapped us between the loads above and here.
        let seen = hdr.seq.load(Ordering::Acquire);
        if seen != self.want_seq {
            self.want_seq = latest;
            self.metrics.resyncs.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        // Epoch fence: adopt the new epoch, skip the sentinel, resync if
        // the new stream has already outrun the window.
        let flags = hdr.flags.load(Ordering::Relaxed);
        if flags & FLAG_EPOCH_FENCE != 0 {
            self.known_epoch = hdr.epoch.load(Ordering::Relaxed);
            self.want_seq += 1;
            let new_latest = self.superblock().write_seq.load(Ordering::Acquire);
            if new_latest > self.want_seq
                && new_latest - self.want_seq >= u64::from(self.slot_count)
            {
                self.want_seq = new_latest - u64::from(self.slot_count) + 1;
            }
            self.metrics.fences.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        // Slot from a different generation without a visible fence:
        // refresh and resync.
        let slot_epoch = hdr.epoch.load(Ordering::Relaxed);
        if slot_epoch != self.known_epoch {
            self.known_epoch = self.superblock().epoch.load(Ordering::Acquire);
            self.want_seq = latest;
            self.metrics.resyncs.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let payload_bytes = hdr.payload_bytes.load(Ordering::Relaxed) as usize;
        let copy_bytes = payload_bytes.min(out.len());
        // SAFETY: the payload region behind the slot header holds
        // slot_payload_bytes >= payload_bytes valid bytes, published
        // before the seq release-store we acquired above.
        unsafe {
            let src = slot.cast::<u8>().add(SLOT_HEADER_LEN);
            ptr::copy_nonoverlapping(src, out.as_mut_ptr(), copy_bytes);
        }

        self.want_seq += 1;
        self.metrics.consumed.fetch_add(1, Ordering::Relaxed);
        copy_bytes
    }

    /// The sequence this reader will try to consume next.
    #[must_use]
    pub fn want_seq(&self) -> u64 {
        self.want_seq
    }

    /// Epoch generation this reader currently trusts.
    #[must_use]
    pub fn known_epoch(&self) -> u32 {
        self.known_epoch
    }

    /// The normalized object name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.region.name()
    }

    fn superblock(&self) -> &Superblock {
        // SAFETY: validated at attach; atomics carry all shared mutation.
        unsafe { &*self.region.as_ptr().cast::<Superblock>() }
    }

    fn slot_ptr(&self, idx: u32) -> *const SlotHeader {
        debug_assert!(idx < self.slot_count);
        let stride = SLOT_HEADER_LEN + self.slot_payload_bytes as usize;
        // SAFETY: same bounds argument as the writer side: the region
        // was opened with room for slot_count slots of this stride.
        unsafe {
            self.region
                .as_ptr()
                .add(PSHM_HEADER_LEN as usize + idx as usize * stride)
                .cast::<SlotHeader>()
        }
    }
}

/// Discovered metadata from a PSHM superblock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShmInfo {
    pub dtype: u8,
    pub rank: u8,
    pub dims: [u32; 8],
    pub slot_count: u32,
    pub slot_payload_bytes: u32,
    pub tokens_per_frame: u32,
    pub rate_hz: f64,
    pub total_size: usize,
}

/// Probe a PSHM object and read its superblock without attaching.
///
/// Opens read-only, maps just the 128-byte superblock, validates
/// magic/version/geometry, and returns the discovered parameters. Used
/// by monitors that attach to rings they did not compile against.
pub fn probe(name: &str) -> Result<ShmInfo> {
    let normalized = normalize_name(name);
    let c_name =
        CString::new(normalized.as_str()).map_err(|_| ShmError::InvalidName(normalized.clone()))?;

    // SAFETY: valid NUL-terminated name; read-only open.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            return Err(ShmError::NotFound(normalized));
        }
        return Err(ShmError::Open(err));
    }

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is the valid descriptor opened above; st is writable.
    if unsafe { libc::fstat(fd, std::ptr::addr_of_mut!(st)) } < 0 {
        let err = io::Error::last_os_error();
        // SAFETY: close the fd we opened.
        unsafe { libc::close(fd) };
        return Err(ShmError::Open(err));
    }
    if (st.st_size as usize) < std::mem::size_of::<Superblock>() {
        // SAFETY: close the fd we opened.
        unsafe { libc::close(fd) };
        return Err(ShmError::InvalidLayout(format!(
            "'{normalized}': smaller than a superblock"
        )));
    }

    // SAFETY: map only the superblock, read-only; fd is valid and the
    // object is at least 128 bytes (checked above).
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            std::mem::size_of::<Superblock>(),
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // SAFETY: the mapping (if any) keeps its own reference.
    unsafe { libc::close(fd) };
    if addr == libc::MAP_FAILED {
        return Err(ShmError::Map(io::Error::last_os_error()));
    }

    // Unmap on every exit path below.
    let result = {
        // SAFETY: addr maps 128 readable bytes at the superblock offset.
        let sb = unsafe { &*addr.cast::<Superblock>() };

        if !sb.validate() {
            Err(ShmError::InvalidLayout(format!(
                "'{normalized}': bad magic/version/header_len"
            )))
        } else if sb.slot_count == 0 || sb.slot_payload_bytes % 8 != 0 {
            Err(ShmError::InvalidLayout(format!(
                "'{normalized}': bad geometry (slots={}, slot_bytes={})",
                sb.slot_count, sb.slot_payload_bytes
            )))
        } else {
            let stride = SLOT_HEADER_LEN + sb.slot_payload_bytes as usize;
            let max_slots = (usize::MAX - std::mem::size_of::<Superblock>()) / stride;
            if sb.slot_count as usize > max_slots {
                Err(ShmError::InvalidLayout(format!(
                    "'{normalized}': geometry overflows"
                )))
            } else {
                let total_size = region_size(sb.slot_count, sb.slot_payload_bytes);
                if (st.st_size as usize) < total_size {
                    Err(ShmError::InvalidLayout(format!(
                        "'{normalized}': object smaller than its declared geometry"
                    )))
                } else {
                    Ok(ShmInfo {
                        dtype: sb.dtype,
                        rank: sb.rank,
                        dims: sb.dims,
                        slot_count: sb.slot_count,
                        slot_payload_bytes: sb.slot_payload_bytes,
                        tokens_per_frame: sb.tokens_per_frame,
                        rate_hz: sb.rate_hz,
                        total_size,
                    })
                }
            }
        }
    };

    // SAFETY: addr came from the successful mmap above.
    unsafe {
        libc::munmap(addr, std::mem::size_of::<Superblock>());
    }

    result
}
