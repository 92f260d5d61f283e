// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rill developers

//! PSHM single-writer publish path.

use super::layout::{SlotHeader, Superblock, FLAG_EPOCH_FENCE, PSHM_MAGIC, PSHM_HEADER_LEN, PSHM_VERSION, SLOT_HEADER_LEN};
use super::region::ShmRegion;
use super::{hash_endpoint_name, normalize_name, region_size, Result, ShmError, StreamContract};
use crate::rt;
use std::ptr;
use std::sync::atomic::Ordering;

/// Owner of a PSHM ring: creates the region, stamps the superblock,
/// publishes slots. Exactly one writer exists per endpoint; the region
/// is unlinked when the writer drops.
pub struct ShmWriter {
    region: ShmRegion,
    slot_count: u32,
    slot_payload_bytes: u32,
    /// Sequences start at 1; 0 marks a never-written slot.
    next_seq: u64,
    current_epoch: u32,
}

impl ShmWriter {
    /// Create the shared-memory object and initialize its superblock.
    ///
    /// `slot_payload_bytes` must be a multiple of 8. Any stale object
    /// with the same name is replaced.
    pub fn create(
        name: &str,
        slot_count: u32,
        slot_payload_bytes: u32,
        contract: &StreamContract,
    ) -> Result<Self> {
        if slot_payload_bytes % 8 != 0 {
            return Err(ShmError::UnalignedSlotBytes(slot_payload_bytes));
        }

        let normalized = normalize_name(name);
        let total = region_size(slot_count, slot_payload_bytes);
        let region = ShmRegion::create(&normalized, total)?;

        // SAFETY: the region was just created with exclusive access and
        // is at least 128 bytes; mmap's page alignment satisfies the
        // superblock's 8-byte alignment. No reader can map the object
        // until after these writes complete.
        let sb = unsafe { &mut *region.as_ptr().cast::<Superblock>() };
        sb.magic = PSHM_MAGIC;
        sb.version = PSHM_VERSION;
        sb.header_len = PSHM_HEADER_LEN;
        sb.flags = 0;
        sb.dtype = contract.dtype as u8;
        sb.rank = contract.rank;
        sb.reserved0 = 0;
        sb.tokens_per_frame = contract.tokens_per_frame;
        sb.slot_count = slot_count;
        sb.slot_payload_bytes = slot_payload_bytes;
        sb.rate_hz = contract.rate_hz;
        sb.stable_id_hash = contract.stable_id_hash;
        sb.epoch.store(0, Ordering::Relaxed);
        sb.reserved1 = 0;
        sb.write_seq.store(0, Ordering::Relaxed);
        sb.writer_heartbeat_ns.store(rt::now_ns(), Ordering::Relaxed);
        for (i, d) in sb.dims.iter_mut().enumerate() {
            *d = if i < contract.rank as usize {
                contract.dims[i]
            } else {
                0
            };
        }
        sb.endpoint_name_hash = hash_endpoint_name(&normalized);
        sb.reserved2 = [0; 24];

        log::debug!(
            "[PSHM] writer created '{normalized}' slots={slot_count} slot_bytes={slot_payload_bytes}"
        );

        Ok(Self {
            region,
            slot_count,
            slot_payload_bytes,
            next_seq: 1,
            current_epoch: 0,
        })
    }

    /// Publish one slot. Returns `false` (without publishing) when the
    /// payload exceeds the slot size.
    pub fn publish(
        &mut self,
        payload: &[u8],
        token_count: u32,
        flags: u32,
        iteration_index: u64,
    ) -> bool {
        if payload.len() > self.slot_payload_bytes as usize {
            return false;
        }

        let seq = self.next_seq;
        let idx = (seq % u64::from(self.slot_count)) as u32;
        let slot = self.slot_ptr(idx);

        // SAFETY: slot points at a valid SlotHeader inside the mapped
        // region (idx < slot_count) and the payload region behind it
        // holds slot_payload_bytes >= payload.len(). Readers only trust
        // these bytes after the release-store of seq below; a reader
        // racing an overwrite detects it by re-checking seq against its
        // expected value.
        unsafe {
            let payload_dst = slot.cast::<u8>().add(SLOT_HEADER_LEN);
            ptr::copy_nonoverlapping(payload.as_ptr(), payload_dst, payload.len());
            ptr::write_bytes(ptr::addr_of_mut!((*slot).reserved), 0, 1);

            let hdr = &*slot;
            hdr.epoch.store(self.current_epoch, Ordering::Relaxed);
            hdr.flags.store(flags, Ordering::Relaxed);
            hdr.iteration_index.store(iteration_index, Ordering::Relaxed);
            hdr.timestamp_ns.store(rt::now_ns(), Ordering::Relaxed);
            hdr.token_count.store(token_count, Ordering::Relaxed);
            hdr.payload_bytes.store(payload.len() as u32, Ordering::Relaxed);

            // Commit: slot first, then the superblock cursor.
            hdr.seq.store(seq, Ordering::Release);
            self.superblock().write_seq.store(seq, Ordering::Release);
            self.superblock()
                .writer_heartbeat_ns
                .store(rt::now_ns(), Ordering::Relaxed);
        }

        self.next_seq = seq + 1;
        true
    }

    /// Publish an epoch fence and bump the epoch. Writers emit this
    /// before changing the stream's logical identity (endpoint rebind)
    /// so readers resynchronize instead of splicing two streams.
    pub fn emit_epoch_fence(&mut self, iteration_index: u64) {
        self.publish(&[], 0, FLAG_EPOCH_FENCE, iteration_index);
        self.current_epoch += 1;
        self.superblock()
            .epoch
            .store(self.current_epoch, Ordering::Release);
        log::debug!(
            "[PSHM] writer '{}' epoch fence -> epoch {}",
            self.region.name(),
            self.current_epoch
        );
    }

    /// Next sequence number to be published.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.next_seq
    }

    /// Current epoch generation.
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.current_epoch
    }

    /// The normalized object name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Ring slot count.
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Payload bytes per slot.
    #[must_use]
    pub fn slot_payload_bytes(&self) -> u32 {
        self.slot_payload_bytes
    }

    fn superblock(&self) -> &Superblock {
        // SAFETY: offset 0 of the mapped region holds the Superblock we
        // initialized in create(); shared refs are fine because all
        // post-init mutation goes through atomic fields.
        unsafe { &*self.region.as_ptr().cast::<Superblock>() }
    }

    fn slot_ptr(&self, idx: u32) -> *mut SlotHeader {
        debug_assert!(idx < self.slot_count);
        let stride = SLOT_HEADER_LEN + self.slot_payload_bytes as usize;
        // SAFETY: the region was sized as superblock + slot_count slots
        // of `stride` bytes, so this offset is in bounds for idx <
        // slot_count; 8-byte alignment holds because the superblock is
        // 128 bytes and stride is a multiple of 8.
        unsafe {
            self.region
                .as_ptr()
                .add(PSHM_HEADER_LEN as usize + idx as usize * stride)
                .cast::<SlotHeader>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::DType;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("rill_w_{tag}_{ts}")
    }

    #[test]
    fn create_rejects_unaligned_slot_bytes() {
        let contract = StreamContract::scalar(DType::F32, 64, 48_000.0);
        let result = ShmWriter::create(&unique_name("align"), 8, 100, &contract);
        assert!(matches!(result, Err(ShmError::UnalignedSlotBytes(100))));
    }

    #[test]
    fn create_stamps_superblock() {
        let name = unique_name("stamp");
        let mut contract = StreamContract::scalar(DType::Cf32, 256, 96_000.0);
        contract.rank = 2;
        contract.dims = [4, 16, 0, 0, 0, 0, 0, 0];
        contract.stable_id_hash = 0xDEAD_BEEF;

        let writer = ShmWriter::create(&name, 16, 512, &contract).expect("create");
        let sb = writer.superblock();
        assert!(sb.validate());
        assert_eq!(sb.dtype, DType::Cf32 as u8);
        assert_eq!(sb.rank, 2);
        assert_eq!(sb.dims[0], 4);
        assert_eq!(sb.dims[1], 16);
        assert_eq!(sb.dims[2], 0);
        assert_eq!(sb.slot_count, 16);
        assert_eq!(sb.slot_payload_bytes, 512);
        assert_eq!(sb.tokens_per_frame, 256);
        assert_eq!(sb.rate_hz, 96_000.0);
        assert_eq!(sb.stable_id_hash, 0xDEAD_BEEF);
        assert_eq!(sb.endpoint_name_hash, hash_endpoint_name(writer.name()));
        assert_eq!(sb.write_seq.load(Ordering::Acquire), 0);
    }

    #[test]
    fn publish_advances_write_seq() {
        let name = unique_name("pub");
        let contract = StreamContract::scalar(DType::F32, 4, 1000.0);
        let mut writer = ShmWriter::create(&name, 8, 64, &contract).expect("create");

        assert_eq!(writer.sequence(), 1);
        assert!(writer.publish(&[1, 2, 3, 4], 1, 0, 0));
        assert_eq!(writer.sequence(), 2);
        assert_eq!(writer.superblock().write_seq.load(Ordering::Acquire), 1);
    }

    #[test]
    fn publish_rejects_oversized_payload() {
        let name = unique_name("big");
        let contract = StreamContract::scalar(DType::I8, 1, 1.0);
        let mut writer = ShmWriter::create(&name, 4, 16, &contract).expect("create");

        assert!(!writer.publish(&[0u8; 17], 17, 0, 0));
        assert_eq!(writer.sequence(), 1);
    }

    #[test]
    fn epoch_fence_bumps_epoch() {
        let name = unique_name("fence");
        let contract = StreamContract::scalar(DType::F32, 4, 1000.0);
        let mut writer = ShmWriter::create(&name, 8, 64, &contract).expect("create");

        writer.publish(&[0u8; 8], 2, 0, 0);
        writer.emit_epoch_fence(7);
        assert_eq!(writer.epoch(), 1);
        assert_eq!(writer.superblock().epoch.load(Ordering::Acquire), 1);
        // Fence consumed a sequence number too.
        assert_eq!(writer.sequence(), 3);
    }
}
