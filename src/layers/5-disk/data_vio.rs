// SPDX-License-Identifier: MPL-2.0

//! The data-VIO: the per-request object that carries one logical block's
//! worth of work through the pipeline.
//!
//! A data-VIO is owned by exactly one zone at a time and moves between
//! zones by being sent over their work channels. The only cross-zone
//! state is the compression-status word, which lets another zone cancel
//! a fragment that is already staged in the packer.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    error::Errno,
    layers::{
        bio::Buf,
        dedup::Fingerprint,
        journal::JournalPoint,
        map::{DataLocation, Lbn, Pbn},
    },
    prelude::*,
};

/// What the data-VIO is doing to its logical block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum VioOperation {
    Read,
    Write,
    ReadModifyWrite,
    Discard,
}

/// Where a data-VIO stands on the compression path. Stored in the low
/// byte of the status word; the sticky may-not-compress flag lives above
/// it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum VioCompressionStage {
    PreCompressor = 0,
    Compressing = 1,
    Packing = 2,
    PostPacker = 3,
}

const STAGE_MASK: u32 = 0x0000_00ff;
const MAY_NOT_COMPRESS: u32 = 0x0000_0100;

/// The cross-zone compression-status word of one data-VIO.
pub(super) struct CompressionStatus(AtomicU32);

impl CompressionStatus {
    pub fn new() -> Self {
        Self(AtomicU32::new(VioCompressionStage::PreCompressor as u32))
    }

    pub fn stage(&self) -> VioCompressionStage {
        match self.0.load(Ordering::Acquire) & STAGE_MASK {
            0 => VioCompressionStage::PreCompressor,
            1 => VioCompressionStage::Compressing,
            2 => VioCompressionStage::Packing,
            _ => VioCompressionStage::PostPacker,
        }
    }

    /// Move to `stage`, keeping the sticky flag. Returns `false` if the
    /// data-VIO may no longer compress, in which case the stage is left
    /// at `PostPacker` and the caller must take the plain write path.
    pub fn advance(&self, stage: VioCompressionStage) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let blocked = current & MAY_NOT_COMPRESS != 0;
            let next = if blocked {
                MAY_NOT_COMPRESS | VioCompressionStage::PostPacker as u32
            } else {
                (current & !STAGE_MASK) | stage as u32
            };
            match self
                .0
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return !blocked,
                Err(observed) => current = observed,
            }
        }
    }

    /// Raise the sticky flag from any zone. Returns the stage the
    /// data-VIO was in at the moment of cancellation: a canceller that
    /// observes `Packing` takes responsibility for pulling the fragment
    /// back out of the packer.
    pub fn cancel(&self) -> VioCompressionStage {
        let prev = self.0.fetch_or(MAY_NOT_COMPRESS, Ordering::AcqRel);
        match prev & STAGE_MASK {
            0 => VioCompressionStage::PreCompressor,
            1 => VioCompressionStage::Compressing,
            2 => VioCompressionStage::Packing,
            _ => VioCompressionStage::PostPacker,
        }
    }

    pub fn may_not_compress(&self) -> bool {
        self.0.load(Ordering::Acquire) & MAY_NOT_COMPRESS != 0
    }

    pub fn reset(&self) {
        self.0.store(
            VioCompressionStage::PreCompressor as u32,
            Ordering::Release,
        );
    }
}

/// The pipeline phases, each annotated with the zone it runs on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum Phase {
    /// Logical zone: take the per-LBN lock, then fall through to
    /// `GetMapped`.
    Launch,
    /// Logical zone: read the old mapping and pick a path.
    GetMapped,
    /// Physical zone of the old mapping: read block data.
    ReadData,
    /// CPU zone: inflate a packed fragment.
    Decompress,
    /// CPU zone: overlay the partial payload, re-check for zeroes, then
    /// fall through to `Hash`.
    Overlay,
    /// CPU zone: fingerprint the block content.
    Hash,
    /// Hash zone: join (or create) the fingerprint's hash lock.
    AcquireHashLock,
    /// Physical zone of the dedup candidate: lock it and read its bytes.
    LockDuplicate,
    /// CPU zone: compare candidate bytes against ours.
    Verify,
    /// Hash zone: the agent's verification verdict is applied.
    DedupConfirm,
    /// Physical zone of the duplicate: add this sharer's reference.
    ShareIncrement,
    /// CPU zone: compress the block.
    Compress,
    /// Packer zone: stage the fragment in a bin.
    Pack,
    /// Physical zone of the chosen allocation zone: allocate a PBN.
    Allocate,
    /// Physical zone of the allocation: write the block data.
    WriteData,
    /// Hash zone: publish the decision and wake same-name waiters.
    FinishHashLock,
    /// Physical zone of the new mapping: commit or take the reference.
    RefUpdate,
    /// Journal zone: record the mapping change.
    JournalEntry,
    /// Logical zone: write the new mapping into the block map.
    UpdateBlockMap,
    /// Physical zone of the old mapping: drop its reference.
    DecrementOld,
    /// Hash zone: detach from the hash lock.
    ReleaseHashLock,
    /// Bio-ack zone: complete the upstream request.
    Acknowledge,
    /// Logical zone: release the LBN lock, continue a discard walk or
    /// return to the pool.
    Cleanup,
}

/// One in-flight logical block of work.
pub(super) struct DataVio {
    pub pool_slot: usize,
    pub phase: Phase,
    pub operation: VioOperation,
    pub lbn: Lbn,

    /// FUA: force the journal and data down before acknowledging.
    pub flush_after: bool,
    pub is_trim: bool,
    pub is_zero_block: bool,
    /// Sub-block request: `offset..offset + length` within the block.
    pub is_partial: bool,
    pub offset: usize,
    pub length: usize,
    /// Byte position of this block's payload within the upstream bio.
    pub bio_offset: usize,

    /// Blocks left in a discard walk, including the current one.
    pub remaining_discard: u64,
    pub flush_generation: u64,

    pub mapped: DataLocation,
    pub new_mapped: DataLocation,
    pub duplicate: Option<DataLocation>,
    pub is_duplicate: bool,
    pub chunk_name: Option<Fingerprint>,

    /// A provisionally-held allocation, pending commitment.
    pub allocation: Option<Pbn>,
    /// Whether this data-VIO's reference on `new_mapped` is already taken.
    pub ref_taken: bool,

    pub logical_zone_id: usize,
    pub physical_zone_id: usize,
    pub hash_zone_id: usize,
    /// Whether this data-VIO still holds its LBN lock.
    pub holds_logical_lock: bool,
    /// Whether this data-VIO is attached to a hash lock.
    pub holds_hash_lock: bool,
    /// Whether this data-VIO holds the READ lock on its dedup candidate.
    pub holds_duplicate_read_lock: bool,
    /// Advice turned out wrong; refresh the index after writing fresh.
    pub advice_stale: bool,
    /// Journal pins outstanding from the recorded entry.
    pub journal_point: Option<JournalPoint>,
    pub holds_logical_pin: bool,
    pub holds_physical_pin: bool,
    /// A read-modify-write still needs its overlay applied.
    pub rmw_pending: bool,

    pub data: Buf,
    pub scratch: Buf,
    pub compressed_size: usize,
    pub compressed: Vec<u8>,
    pub compression: Arc<CompressionStatus>,

    /// First failure wins.
    pub result: Option<Errno>,
    pub parent: Option<Arc<super::bio::BioShare>>,
    pub has_discard_permit: bool,
}

impl DataVio {
    pub fn new(pool_slot: usize) -> Result<Self> {
        Ok(Self {
            pool_slot,
            phase: Phase::Launch,
            operation: VioOperation::Read,
            lbn: 0,
            flush_after: false,
            is_trim: false,
            is_zero_block: false,
            is_partial: false,
            offset: 0,
            length: 0,
            bio_offset: 0,
            remaining_discard: 0,
            flush_generation: 0,
            mapped: DataLocation::UNMAPPED,
            new_mapped: DataLocation::UNMAPPED,
            duplicate: None,
            is_duplicate: false,
            chunk_name: None,
            allocation: None,
            ref_taken: false,
            logical_zone_id: 0,
            physical_zone_id: 0,
            hash_zone_id: 0,
            holds_logical_lock: false,
            holds_hash_lock: false,
            holds_duplicate_read_lock: false,
            advice_stale: false,
            journal_point: None,
            holds_logical_pin: false,
            holds_physical_pin: false,
            rmw_pending: false,
            data: Buf::alloc(1)?,
            scratch: Buf::alloc(1)?,
            compressed_size: 0,
            compressed: Vec::with_capacity(BLOCK_SIZE),
            compression: Arc::new(CompressionStatus::new()),
            result: None,
            parent: None,
            has_discard_permit: false,
        })
    }

    /// Scrub per-request state before reuse. The buffers and the status
    /// word allocation stay.
    pub fn reset(&mut self) {
        self.phase = Phase::Launch;
        self.operation = VioOperation::Read;
        self.lbn = 0;
        self.flush_after = false;
        self.is_trim = false;
        self.is_zero_block = false;
        self.is_partial = false;
        self.offset = 0;
        self.length = 0;
        self.bio_offset = 0;
        self.remaining_discard = 0;
        self.flush_generation = 0;
        self.mapped = DataLocation::UNMAPPED;
        self.new_mapped = DataLocation::UNMAPPED;
        self.duplicate = None;
        self.is_duplicate = false;
        self.chunk_name = None;
        self.allocation = None;
        self.ref_taken = false;
        self.logical_zone_id = 0;
        self.physical_zone_id = 0;
        self.hash_zone_id = 0;
        self.holds_logical_lock = false;
        self.holds_hash_lock = false;
        self.holds_duplicate_read_lock = false;
        self.advice_stale = false;
        self.journal_point = None;
        self.holds_logical_pin = false;
        self.holds_physical_pin = false;
        self.rmw_pending = false;
        self.compressed_size = 0;
        self.compressed.clear();
        self.compression.reset();
        self.result = None;
        self.parent = None;
        self.has_discard_permit = false;
    }

    /// Reuse this data-VIO for the next block of its discard walk.
    pub fn continue_discard(&mut self) {
        debug_assert!(self.remaining_discard > 1);
        self.lbn += 1;
        self.remaining_discard -= 1;
        self.phase = Phase::Launch;
        self.mapped = DataLocation::UNMAPPED;
        self.new_mapped = DataLocation::UNMAPPED;
        self.duplicate = None;
        self.is_duplicate = false;
        self.chunk_name = None;
        self.allocation = None;
        self.ref_taken = false;
        self.holds_logical_lock = false;
        self.holds_hash_lock = false;
        self.holds_duplicate_read_lock = false;
        self.advice_stale = false;
        self.journal_point = None;
        self.holds_logical_pin = false;
        self.holds_physical_pin = false;
        self.rmw_pending = false;
        self.is_zero_block = false;
        self.is_partial = false;
        self.offset = 0;
        self.length = 0;
        self.compressed_size = 0;
        self.compressed.clear();
        self.compression.reset();
    }

    /// Record the first failure.
    pub fn set_result(&mut self, errno: Errno) {
        if self.result.is_none() {
            self.result = Some(errno);
        }
    }
}

impl Debug for DataVio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataVio")
            .field("pool_slot", &self.pool_slot)
            .field("phase", &self.phase)
            .field("operation", &self.operation)
            .field("lbn", &self.lbn)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_sticky_and_reports_stage() {
        let status = CompressionStatus::new();
        assert!(status.advance(VioCompressionStage::Compressing));
        assert!(status.advance(VioCompressionStage::Packing));

        assert_eq!(status.cancel(), VioCompressionStage::Packing);
        assert!(status.may_not_compress());
        // Once cancelled, the path may no longer advance.
        assert!(!status.advance(VioCompressionStage::Packing));
        assert_eq!(status.stage(), VioCompressionStage::PostPacker);

        status.reset();
        assert!(!status.may_not_compress());
        assert_eq!(status.stage(), VioCompressionStage::PreCompressor);
    }

    #[test]
    fn first_result_wins() {
        let mut vio = DataVio::new(0).unwrap();
        vio.set_result(Errno::OutOfSpace);
        vio.set_result(Errno::IoFailed);
        assert_eq!(vio.result, Some(Errno::OutOfSpace));
    }
}
