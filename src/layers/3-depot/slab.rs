// SPDX-License-Identifier: MPL-2.0

//! A slab: the unit of physical allocation.
//!
//! A slab owns a contiguous PBN range, laid out as its reference-count
//! area, its slab-journal tail, then its data area. Every change to a
//! reference count is recorded as a slab-journal delta; dirty count
//! blocks and pending deltas are persisted together on a sync.

use super::ref_counts::RefCounts;
use crate::{
    layers::{
        bio::{BlockSet, Buf, Extent},
        map::Pbn,
    },
    prelude::*,
};

const JOURNAL_BLOCK_MAGIC: u32 = 0x534a_4442;
const JOURNAL_BLOCK_HEADER_SIZE: usize = 16;
const JOURNAL_RECORD_SIZE: usize = 5;
const RECORDS_PER_JOURNAL_BLOCK: usize =
    (BLOCK_SIZE - JOURNAL_BLOCK_HEADER_SIZE) / JOURNAL_RECORD_SIZE;

/// Recovery standing of a slab.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlabStatus {
    /// In-memory reference counts are authoritative.
    Rebuilt,
    /// The slab was dirty at the last shutdown and awaits a rebuild.
    RequiresScrubbing,
    /// Like `RequiresScrubbing`, but wanted for allocation soon.
    HighPriorityScrubbing,
    /// A rebuild scan is repopulating the counts.
    Rebuilding,
    /// Slab-journal deltas are being replayed into the counts.
    Replaying,
}

/// One reference-count delta recorded in the slab journal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlabJournalOp {
    Increment = 1,
    Decrement = 2,
    Provisional = 3,
    Commit = 4,
    Release = 5,
}

#[derive(Clone, Copy, Debug)]
pub struct SlabJournalRecord {
    pub op: SlabJournalOp,
    pub offset: u32,
}

/// The tail of reference-count deltas not yet persisted.
pub struct SlabJournal {
    pending: Vec<SlabJournalRecord>,
    /// Journal blocks written so far; the ring position derives from it.
    blocks_written: u64,
}

impl SlabJournal {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            blocks_written: 0,
        }
    }

    /// Record one delta.
    pub fn record(&mut self, op: SlabJournalOp, offset: usize) {
        self.pending.push(SlabJournalRecord {
            op,
            offset: offset as u32,
        });
    }

    /// The number of unpersisted deltas.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Write all pending deltas into the journal area ring.
    pub fn persist<D: BlockSet>(
        &mut self,
        device: &D,
        area_start: BlockId,
        area_blocks: usize,
    ) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        for chunk in self.pending.chunks(RECORDS_PER_JOURNAL_BLOCK) {
            let mut buf = Buf::alloc(1)?;
            let slice = buf.as_mut_slice();
            slice[0..4].copy_from_slice(&JOURNAL_BLOCK_MAGIC.to_le_bytes());
            slice[4..6].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            for (nth, record) in chunk.iter().enumerate() {
                let offset = JOURNAL_BLOCK_HEADER_SIZE + nth * JOURNAL_RECORD_SIZE;
                slice[offset] = record.op as u8;
                slice[offset + 1..offset + 5].copy_from_slice(&record.offset.to_le_bytes());
            }

            let pos = area_start + (self.blocks_written % area_blocks as u64) as usize;
            device.write(pos, buf.as_ref())?;
            self.blocks_written += 1;
        }
        self.pending.clear();
        Ok(())
    }
}

/// A slab and its in-memory state.
pub struct Slab {
    pub slab_number: usize,
    /// First block of the slab (the reference-count area).
    pub start: Pbn,
    /// First data block.
    pub data_start: Pbn,
    pub ref_area_blocks: usize,
    pub journal_area_blocks: usize,
    pub status: SlabStatus,
    pub priority: u8,
    pub ref_counts: RefCounts,
    pub journal: SlabJournal,
}

impl Slab {
    /// Carve a fresh slab out of `[start, start + slab_blocks)`.
    pub fn new(slab_number: usize, start: Pbn, slab_blocks: usize) -> Result<Self> {
        let journal_area_blocks = 2usize;
        if slab_blocks <= journal_area_blocks + 1 {
            return_errno_with_msg!(InvalidArgs, "slab too small for its metadata");
        }
        // One count byte per data block; the count area competes with the
        // data area for the same budget.
        let budget = slab_blocks - journal_area_blocks;
        let ref_area_blocks = budget.div_ceil(BLOCK_SIZE + 1);
        let data_blocks = budget - ref_area_blocks;

        Ok(Self {
            slab_number,
            start,
            data_start: start + (ref_area_blocks + journal_area_blocks) as Pbn,
            ref_area_blocks,
            journal_area_blocks,
            status: SlabStatus::Rebuilt,
            priority: u8::MAX,
            ref_counts: RefCounts::new(data_blocks),
            journal: SlabJournal::new(),
        })
    }

    /// The number of data blocks.
    pub fn data_blocks(&self) -> usize {
        self.ref_counts.len()
    }

    /// Whether `pbn` falls in this slab's data area.
    pub fn contains(&self, pbn: Pbn) -> bool {
        pbn >= self.data_start && pbn < self.data_start + self.data_blocks() as Pbn
    }

    /// The count-byte offset of a data-area `pbn`.
    pub fn offset_of(&self, pbn: Pbn) -> Result<usize> {
        if !self.contains(pbn) {
            return_errno_with_msg!(OutOfRange, "PBN is outside the slab data area");
        }
        Ok((pbn - self.data_start) as usize)
    }

    /// The data-area PBN at a count-byte offset.
    pub fn pbn_at(&self, offset: usize) -> Pbn {
        debug_assert!(offset < self.data_blocks());
        self.data_start + offset as Pbn
    }

    /// Whether the in-memory counts may be consulted and changed.
    pub fn is_recovered(&self) -> bool {
        self.status == SlabStatus::Rebuilt
    }

    /// Take a provisional reference on a free block, if any.
    pub fn allocate_provisional(&mut self) -> Option<Pbn> {
        if !self.is_recovered() {
            return None;
        }
        let offset = self.ref_counts.allocate_provisional()?;
        self.journal.record(SlabJournalOp::Provisional, offset);
        Some(self.pbn_at(offset))
    }

    /// Convert a provisional reference into the first real reference.
    pub fn commit_provisional(&mut self, pbn: Pbn) -> Result<()> {
        let offset = self.offset_of(pbn)?;
        self.ref_counts.commit_provisional(offset)?;
        self.journal.record(SlabJournalOp::Commit, offset);
        Ok(())
    }

    /// Return a provisional reference to the free pool.
    pub fn release_provisional(&mut self, pbn: Pbn) -> Result<()> {
        let offset = self.offset_of(pbn)?;
        self.ref_counts.release_provisional(offset)?;
        self.journal.record(SlabJournalOp::Release, offset);
        Ok(())
    }

    /// Add a reference for a new sharer; `false` means the count is
    /// saturated and the sharer must write fresh instead.
    pub fn try_increment(&mut self, pbn: Pbn) -> Result<bool> {
        let offset = self.offset_of(pbn)?;
        if !self.is_recovered() {
            return_errno_with_msg!(Protocol, "incrementing in an unrecovered slab");
        }
        let incremented = self.ref_counts.try_increment(offset)?;
        if incremented {
            self.journal.record(SlabJournalOp::Increment, offset);
        }
        Ok(incremented)
    }

    /// Drop one reference; returns whether the block became free. In an
    /// unrecovered slab the delta is deferred through the slab journal
    /// without touching the in-memory counts.
    pub fn decrement(&mut self, pbn: Pbn) -> Result<bool> {
        let offset = self.offset_of(pbn)?;
        self.journal.record(SlabJournalOp::Decrement, offset);
        if self.is_recovered() {
            let freed = self.ref_counts.get(offset) == 1;
            self.ref_counts.decrement(offset)?;
            Ok(freed)
        } else {
            Ok(false)
        }
    }

    /// Persist dirty count blocks (in contiguous extents) and pending
    /// journal deltas.
    pub fn persist<D: BlockSet>(&mut self, device: &D) -> Result<()> {
        let dirty = self.ref_counts.dirty_block_indexes();
        let mut run: Vec<usize> = Vec::new();
        for index in dirty {
            if let Some(&last) = run.last() {
                if index != last + 1 {
                    self.persist_count_blocks(device, &run)?;
                    run.clear();
                }
            }
            run.push(index);
        }
        if !run.is_empty() {
            self.persist_count_blocks(device, &run)?;
        }
        self.ref_counts.mark_clean();

        let journal_start = self.start as BlockId + self.ref_area_blocks;
        self.journal
            .persist(device, journal_start, self.journal_area_blocks)
    }

    /// Load the persisted count bytes of a clean slab.
    pub fn load_ref_counts<D: BlockSet>(&mut self, device: &D) -> Result<()> {
        let data_blocks = self.data_blocks();
        let mut extent = Extent::alloc(self.start as BlockId, self.ref_area_blocks)?;
        extent.submit_read(device)?;

        let mut bytes = Vec::with_capacity(data_blocks);
        for buf in extent.into_bufs() {
            let take = (data_blocks - bytes.len()).min(BLOCK_SIZE);
            bytes.extend_from_slice(&buf.as_slice()[..take]);
            if bytes.len() == data_blocks {
                break;
            }
        }
        self.ref_counts = RefCounts::from_bytes(bytes);
        Ok(())
    }

    fn persist_count_blocks<D: BlockSet>(&self, device: &D, run: &[usize]) -> Result<()> {
        let counts = self.ref_counts.as_bytes();
        let mut bufs = Vec::with_capacity(run.len());
        for &index in run {
            let mut buf = Buf::alloc(1)?;
            let from = index * BLOCK_SIZE;
            let to = (from + BLOCK_SIZE).min(counts.len());
            buf.as_mut_slice()[..to - from].copy_from_slice(&counts[from..to]);
            bufs.push(buf);
        }
        let extent = Extent::with_bufs(self.start as BlockId + run[0], bufs)?;
        extent.submit_write(device)
    }
}

impl Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("slab_number", &self.slab_number)
            .field("data_start", &self.data_start)
            .field("data_blocks", &self.data_blocks())
            .field("free", &self.ref_counts.free_count())
            .field("status", &self.status)
            .finish()
    }
}
