// SPDX-License-Identifier: MPL-2.0

//! The slab depot: all slabs, one block allocator per physical zone, and
//! the slab summary that lets recovery skip clean slabs.

use core::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::slab::{Slab, SlabStatus};
use crate::{
    layers::{
        bio::{BlockSet, Buf},
        map::{DataLocation, Pbn},
    },
    os::Mutex,
    prelude::*,
    util::BitMap,
};

/// Static geometry of the depot.
#[derive(Clone, Copy, Debug)]
pub struct DepotConfig {
    pub slab_count: usize,
    pub slab_blocks: usize,
    pub physical_zones: usize,
}

impl DepotConfig {
    /// Device blocks the slab area occupies.
    pub fn area_blocks(&self) -> usize {
        self.slab_count * self.slab_blocks
    }
}

/// The compact per-slab descriptor table. A clean slab's persisted
/// reference counts are current, so recovery loads them directly; a
/// dirty slab must be rebuilt from the block map.
#[derive(Serialize, Deserialize)]
struct SummaryState {
    clean: BitMap,
    free_hints: Vec<u32>,
}

/// Per-physical-zone allocation state.
struct BlockAllocator {
    /// Global indexes of the slabs this zone owns.
    slabs: Vec<usize>,
    /// Position in `slabs` of the open slab.
    open: usize,
}

/// The slab depot.
pub struct SlabDepot<D> {
    device: D,
    summary_region: D,
    config: DepotConfig,
    area_start: Pbn,
    slabs: Vec<Mutex<Slab>>,
    allocators: Vec<Mutex<BlockAllocator>>,
    /// Cross-zone approximation of the free-block total.
    free_blocks: AtomicU64,
    summary: Mutex<SummaryState>,
}

impl<D: BlockSet> SlabDepot<D> {
    /// Assemble the in-memory depot. The caller decides whether to format
    /// or recover its persistent state.
    fn build(device: D, summary_region: D, area_start: Pbn, config: DepotConfig) -> Result<Self> {
        if config.slab_count == 0 || config.physical_zones == 0 {
            return_errno_with_msg!(InvalidArgs, "depot needs at least one slab and one zone");
        }
        let mut slabs = Vec::with_capacity(config.slab_count);
        for nth in 0..config.slab_count {
            let start = area_start + (nth * config.slab_blocks) as Pbn;
            slabs.push(Mutex::new(Slab::new(nth, start, config.slab_blocks)?));
        }

        let allocators = (0..config.physical_zones)
            .map(|zone| {
                let owned = (0..config.slab_count)
                    .filter(|nth| nth % config.physical_zones == zone)
                    .collect();
                Mutex::new(BlockAllocator {
                    slabs: owned,
                    open: 0,
                })
            })
            .collect();

        let free: u64 = slabs
            .iter()
            .map(|slab| slab.lock().ref_counts.free_count() as u64)
            .sum();
        let summary = SummaryState {
            clean: BitMap::repeat(true, config.slab_count),
            free_hints: vec![0; config.slab_count],
        };

        Ok(Self {
            device,
            summary_region,
            config,
            area_start,
            slabs,
            allocators,
            free_blocks: AtomicU64::new(free),
            summary: Mutex::new(summary),
        })
    }

    /// Write a fresh depot: zeroed count areas, empty journals, an
    /// all-clean summary.
    pub fn format(
        device: D,
        summary_region: D,
        area_start: Pbn,
        config: DepotConfig,
    ) -> Result<Self> {
        let depot = Self::build(device, summary_region, area_start, config)?;
        let zero = Buf::alloc(1)?;
        for slab in &depot.slabs {
            let slab = slab.lock();
            let meta_blocks = slab.ref_area_blocks + slab.journal_area_blocks;
            for nth in 0..meta_blocks {
                depot.device.write(slab.start as BlockId + nth, zero.as_ref())?;
            }
        }
        depot.persist_summary()?;
        Ok(depot)
    }

    /// Recover the depot. Clean slabs load their persisted counts; dirty
    /// slabs come back empty in `RequiresScrubbing` and await a rebuild
    /// scan. Returns the depot and the dirty slab indexes.
    pub fn open(
        device: D,
        summary_region: D,
        area_start: Pbn,
        config: DepotConfig,
    ) -> Result<(Self, Vec<usize>)> {
        let depot = Self::build(device, summary_region, area_start, config)?;

        let mut buf = Buf::alloc(1)?;
        depot.summary_region.read(0, buf.as_mut())?;
        let state: SummaryState = postcard::from_bytes(buf.as_slice())
            .map_err(|_| Error::with_msg(Unrecoverable, "slab summary is corrupt"))?;
        if state.clean.len() != config.slab_count {
            return_errno_with_msg!(Unrecoverable, "slab summary disagrees with geometry");
        }

        let mut dirty = Vec::new();
        for nth in 0..config.slab_count {
            let mut slab = depot.slabs[nth].lock();
            if state.clean.test_bit(nth) {
                slab.load_ref_counts(&depot.device)?;
                slab.status = SlabStatus::Rebuilt;
            } else {
                slab.status = SlabStatus::RequiresScrubbing;
                dirty.push(nth);
            }
        }
        *depot.summary.lock() = state;
        depot.recount_free_blocks();
        Ok((depot, dirty))
    }

    /// The physical zone owning `pbn`.
    pub fn zone_of(&self, pbn: Pbn) -> Result<usize> {
        Ok(self.slab_of(pbn)? % self.config.physical_zones)
    }

    /// Allocate a free block in `zone`, leaving a provisional reference
    /// on it. Prefers the open slab; on exhaustion rotates to the zone's
    /// recovered slab with the most free blocks.
    pub fn allocate(&self, zone: usize) -> Result<Pbn> {
        let mut allocator = self.allocators[zone].lock();

        let open_idx = allocator.slabs[allocator.open];
        if let Some(pbn) = self.slabs[open_idx].lock().allocate_provisional() {
            drop(allocator);
            self.note_mutated(open_idx)?;
            self.free_blocks.fetch_sub(1, Ordering::Relaxed);
            return Ok(pbn);
        }

        // Rotate: rank the zone's slabs by free space.
        let mut best: Option<(usize, usize, usize)> = None;
        for (pos, &idx) in allocator.slabs.iter().enumerate() {
            let mut slab = self.slabs[idx].lock();
            let free = slab.ref_counts.free_count();
            slab.priority = Self::priority_of(free, slab.data_blocks());
            if slab.is_recovered() && free > 0 {
                if best.map(|(_, _, best_free)| free > best_free).unwrap_or(true) {
                    best = Some((pos, idx, free));
                }
            }
        }
        let Some((pos, idx, _)) = best else {
            return_errno_with_msg!(OutOfSpace, "no physical zone slab has a free block");
        };
        allocator.open = pos;
        let pbn = self.slabs[idx]
            .lock()
            .allocate_provisional()
            .ok_or(Error::with_msg(OutOfSpace, "open slab emptied underfoot"))?;
        drop(allocator);
        self.note_mutated(idx)?;
        self.free_blocks.fetch_sub(1, Ordering::Relaxed);
        Ok(pbn)
    }

    /// Convert the provisional reference on `pbn` into a real one.
    pub fn commit_provisional(&self, pbn: Pbn) -> Result<()> {
        let idx = self.slab_of(pbn)?;
        self.note_mutated(idx)?;
        self.slabs[idx].lock().commit_provisional(pbn)
    }

    /// Drop the provisional reference on `pbn`, freeing the block.
    pub fn release_provisional(&self, pbn: Pbn) -> Result<()> {
        let idx = self.slab_of(pbn)?;
        self.note_mutated(idx)?;
        self.slabs[idx].lock().release_provisional(pbn)?;
        self.free_blocks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Add a reference for a dedup sharer; `false` means saturated.
    pub fn try_increment(&self, pbn: Pbn) -> Result<bool> {
        let idx = self.slab_of(pbn)?;
        self.note_mutated(idx)?;
        self.slabs[idx].lock().try_increment(pbn)
    }

    /// Drop one reference.
    pub fn decrement(&self, pbn: Pbn) -> Result<()> {
        let idx = self.slab_of(pbn)?;
        self.note_mutated(idx)?;
        let freed = self.slabs[idx].lock().decrement(pbn)?;
        if freed {
            self.free_blocks.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// The raw count byte for `pbn`.
    pub fn reference_count(&self, pbn: Pbn) -> Result<u8> {
        let idx = self.slab_of(pbn)?;
        let slab = self.slabs[idx].lock();
        let offset = slab.offset_of(pbn)?;
        Ok(slab.ref_counts.get(offset))
    }

    /// Whether `pbn` addresses a data block of some slab.
    pub fn is_data_pbn(&self, pbn: Pbn) -> bool {
        self.slab_of(pbn)
            .map(|idx| self.slabs[idx].lock().contains(pbn))
            .unwrap_or(false)
    }

    /// The cross-zone free-block approximation.
    pub fn free_block_count(&self) -> u64 {
        self.free_blocks.load(Ordering::Relaxed)
    }

    /// Total data blocks across all slabs.
    pub fn total_data_blocks(&self) -> u64 {
        self.slabs
            .iter()
            .map(|slab| slab.lock().data_blocks() as u64)
            .sum()
    }

    /// Put the given slabs into their rebuild scan.
    pub fn begin_rebuild(&self, dirty: &[usize]) {
        for &nth in dirty {
            let mut slab = self.slabs[nth].lock();
            slab.status = SlabStatus::Rebuilding;
            let data_blocks = slab.data_blocks();
            slab.ref_counts = super::ref_counts::RefCounts::new(data_blocks);
        }
    }

    /// Count one block-map reference during a rebuild scan. References
    /// into slabs that are not rebuilding are already counted by their
    /// persisted state and are left alone.
    pub fn apply_rebuild_reference(&self, loc: DataLocation) -> Result<()> {
        if !loc.is_allocated() {
            return Ok(());
        }
        let idx = self.slab_of(loc.pbn)?;
        let mut slab = self.slabs[idx].lock();
        if slab.status != SlabStatus::Rebuilding {
            return Ok(());
        }
        let offset = slab.offset_of(loc.pbn)?;
        slab.ref_counts.increment_for_rebuild(offset);
        Ok(())
    }

    /// Finish the rebuild scan: the given slabs become authoritative.
    pub fn finish_rebuild(&self, dirty: &[usize]) {
        for &nth in dirty {
            self.slabs[nth].lock().status = SlabStatus::Rebuilt;
        }
        self.recount_free_blocks();
    }

    /// Persist every slab's dirty counts and journal tail, then mark the
    /// whole summary clean.
    pub fn persist_all(&self) -> Result<()> {
        for slab in &self.slabs {
            slab.lock().persist(&self.device)?;
        }
        {
            let mut summary = self.summary.lock();
            for nth in 0..self.config.slab_count {
                summary.clean.set_bit(nth);
                summary.free_hints[nth] =
                    self.slabs[nth].lock().ref_counts.free_count() as u32;
            }
        }
        self.persist_summary()
    }

    fn slab_of(&self, pbn: Pbn) -> Result<usize> {
        if pbn < self.area_start {
            return_errno_with_msg!(OutOfRange, "PBN is below the slab area");
        }
        let idx = ((pbn - self.area_start) as usize) / self.config.slab_blocks;
        if idx >= self.config.slab_count {
            return_errno_with_msg!(OutOfRange, "PBN is beyond the slab area");
        }
        Ok(idx)
    }

    fn priority_of(free: usize, data_blocks: usize) -> u8 {
        ((free * u8::MAX as usize) / data_blocks.max(1)) as u8
    }

    /// A mutation is about to touch `slab`; if its summary bit says
    /// clean, dirty it on disk first so recovery never trusts stale
    /// counts.
    fn note_mutated(&self, slab: usize) -> Result<()> {
        let mut summary = self.summary.lock();
        if summary.clean.test_bit(slab) {
            summary.clean.clear_bit(slab);
            drop(summary);
            self.persist_summary()?;
        }
        Ok(())
    }

    fn persist_summary(&self) -> Result<()> {
        let bytes = {
            let summary = self.summary.lock();
            postcard::to_allocvec(&*summary)
                .map_err(|_| Error::with_msg(OutOfMemory, "slab summary serialization failed"))?
        };
        if bytes.len() > self.summary_region.nblocks() * BLOCK_SIZE {
            return_errno_with_msg!(OutOfRange, "slab summary outgrew its region");
        }
        let mut buf = Buf::alloc(1)?;
        buf.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
        self.summary_region.write(0, buf.as_ref())
    }

    fn recount_free_blocks(&self) {
        let free: u64 = self
            .slabs
            .iter()
            .map(|slab| {
                let slab = slab.lock();
                if slab.is_recovered() {
                    slab.ref_counts.free_count() as u64
                } else {
                    0
                }
            })
            .sum();
        self.free_blocks.store(free, Ordering::Relaxed);
    }
}

impl<D> Debug for SlabDepot<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabDepot")
            .field("slab_count", &self.config.slab_count)
            .field("physical_zones", &self.config.physical_zones)
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}
