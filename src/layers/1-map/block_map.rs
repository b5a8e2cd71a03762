// SPDX-License-Identifier: MPL-2.0

//! The block map: a paged LBN -> (PBN, state) indirection.
//!
//! The map is a three-level tree persisted in its own region of the
//! backing device: one root page whose entries name the interior pages,
//! interior pages whose entries name the leaf pages, and leaf pages of
//! packed five-byte entries. All pages are placed at format time; the
//! data path only ever reads and rewrites leaves.
//!
//! # Concurrency
//!
//! Leaf pages are partitioned among logical zones by page number, so a
//! page is only ever touched from its owning zone. Each zone keeps an
//! LRU cache of its leaf pages; updates write through to the region, so
//! an evicted page is always clean.

use core::num::NonZeroUsize;

use lru::LruCache;

use super::{
    entry::{pack_entry, unpack_entry, DataLocation, ENTRY_SIZE},
    Lbn,
};
use crate::{
    layers::bio::{BlockSet, Buf, Extent},
    os::Mutex,
    prelude::*,
};

/// Packed entries per map page.
const ENTRIES_PER_PAGE: usize = (BLOCK_SIZE - PAGE_HEADER_SIZE) / ENTRY_SIZE;
const PAGE_HEADER_SIZE: usize = 16;
const PAGE_MAGIC: u32 = 0x4d50_4442;

const KIND_ROOT: u8 = 0;
const KIND_INTERIOR: u8 = 1;
const KIND_LEAF: u8 = 2;

/// How many leaf pages to read per extent while scanning the whole map.
const SCAN_BATCH: usize = 16;

/// A single page of the block-map tree.
struct MapPage {
    buf: Buf,
}

impl MapPage {
    fn new(kind: u8) -> Result<Self> {
        let mut buf = Buf::alloc(1)?;
        let slice = buf.as_mut_slice();
        slice[0..4].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
        slice[4] = kind;
        slice[5] = 1; // layout version
        Ok(Self { buf })
    }

    fn from_buf(buf: Buf, expected_kind: u8) -> Result<Self> {
        let slice = buf.as_slice();
        let magic = u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]);
        if magic != PAGE_MAGIC || slice[4] != expected_kind {
            return_errno_with_msg!(Unrecoverable, "block-map page header is corrupt");
        }
        Ok(Self { buf })
    }

    fn entry(&self, slot: usize) -> Result<DataLocation> {
        debug_assert!(slot < ENTRIES_PER_PAGE);
        let offset = PAGE_HEADER_SIZE + slot * ENTRY_SIZE;
        let mut bytes = [0u8; ENTRY_SIZE];
        bytes.copy_from_slice(&self.buf.as_slice()[offset..offset + ENTRY_SIZE]);
        unpack_entry(&bytes)
    }

    fn set_entry(&mut self, slot: usize, loc: DataLocation) {
        debug_assert!(slot < ENTRIES_PER_PAGE);
        let offset = PAGE_HEADER_SIZE + slot * ENTRY_SIZE;
        self.buf.as_mut_slice()[offset..offset + ENTRY_SIZE].copy_from_slice(&pack_entry(loc));
    }
}

/// The LBN -> (PBN, state) map of the whole device.
pub struct BlockMap<D> {
    region: D,
    logical_blocks: u64,
    nleaves: usize,
    leaf_base: BlockId,
    zones: Vec<Mutex<LruCache<usize, MapPage>>>,
}

impl<D: BlockSet> BlockMap<D> {
    /// The number of region blocks needed to map `logical_blocks` LBNs.
    pub fn required_blocks(logical_blocks: u64) -> usize {
        let nleaves = (logical_blocks as usize).div_ceil(ENTRIES_PER_PAGE);
        let ninterior = nleaves.div_ceil(ENTRIES_PER_PAGE);
        1 + ninterior + nleaves
    }

    /// Write a fresh, fully-unmapped tree into `region`.
    pub fn format(region: &D, logical_blocks: u64) -> Result<()> {
        let nleaves = (logical_blocks as usize).div_ceil(ENTRIES_PER_PAGE);
        let ninterior = nleaves.div_ceil(ENTRIES_PER_PAGE);
        if region.nblocks() < 1 + ninterior + nleaves {
            return_errno_with_msg!(OutOfRange, "block-map region is too small");
        }
        let leaf_base = 1 + ninterior;

        let mut root = MapPage::new(KIND_ROOT)?;
        for nth in 0..ninterior {
            root.set_entry(nth, DataLocation::uncompressed((1 + nth) as u64));
        }
        region.write(0, root.buf.as_ref())?;

        for nth in 0..ninterior {
            let mut interior = MapPage::new(KIND_INTERIOR)?;
            for slot in 0..ENTRIES_PER_PAGE {
                let leaf = nth * ENTRIES_PER_PAGE + slot;
                if leaf >= nleaves {
                    break;
                }
                interior.set_entry(slot, DataLocation::uncompressed((leaf_base + leaf) as u64));
            }
            region.write(1 + nth, interior.buf.as_ref())?;
        }

        let leaf = MapPage::new(KIND_LEAF)?;
        for nth in 0..nleaves {
            region.write(leaf_base + nth, leaf.buf.as_ref())?;
        }
        Ok(())
    }

    /// Open the tree in `region`, validating the root and interior pages.
    pub fn open(
        region: D,
        logical_blocks: u64,
        nzones: usize,
        cache_pages_per_zone: usize,
    ) -> Result<Self> {
        debug_assert!(nzones > 0);
        let nleaves = (logical_blocks as usize).div_ceil(ENTRIES_PER_PAGE);
        let ninterior = nleaves.div_ceil(ENTRIES_PER_PAGE);
        let leaf_base = 1 + ninterior;

        let mut buf = Buf::alloc(1)?;
        region.read(0, buf.as_mut())?;
        let root = MapPage::from_buf(buf, KIND_ROOT)?;

        for nth in 0..ninterior {
            let loc = root.entry(nth)?;
            if loc.pbn != (1 + nth) as u64 {
                return_errno_with_msg!(Unrecoverable, "block-map root names a stray interior page");
            }
            let mut buf = Buf::alloc(1)?;
            region.read(1 + nth, buf.as_mut())?;
            MapPage::from_buf(buf, KIND_INTERIOR)?;
        }

        let cap = NonZeroUsize::new(cache_pages_per_zone.max(1)).unwrap();
        let zones = (0..nzones).map(|_| Mutex::new(LruCache::new(cap))).collect();

        Ok(Self {
            region,
            logical_blocks,
            nleaves,
            leaf_base,
            zones,
        })
    }

    /// The logical zone owning `lbn`'s leaf page.
    pub fn zone_of(&self, lbn: Lbn) -> usize {
        (lbn as usize / ENTRIES_PER_PAGE) % self.zones.len()
    }

    /// Look up the current location of `lbn`.
    pub fn get_mapped(&self, lbn: Lbn) -> Result<DataLocation> {
        let (page_no, slot) = self.locate(lbn)?;
        let mut cache = self.zones[self.zone_of(lbn)].lock();
        self.load_page(&mut cache, page_no)?;
        cache.get(&page_no).unwrap().entry(slot)
    }

    /// Update the location of `lbn`, writing the leaf through to the region.
    ///
    /// The caller must hold the recovery-journal lock covering this update
    /// and release it only after this returns, once the leaf is persisted.
    pub fn put_mapped(&self, lbn: Lbn, loc: DataLocation) -> Result<()> {
        let (page_no, slot) = self.locate(lbn)?;
        let mut cache = self.zones[self.zone_of(lbn)].lock();
        self.load_page(&mut cache, page_no)?;
        let page = cache.get_mut(&page_no).unwrap();
        page.set_entry(slot, loc);
        self.region.write(page_no, page.buf.as_ref())
    }

    /// Visit every mapped entry of the whole tree, in LBN order.
    ///
    /// Reads leaves straight from the region in batched extents; meant for
    /// recovery scans before the zones start serving.
    pub fn scan_mapped<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(Lbn, DataLocation) -> Result<()>,
    {
        let mut nth = 0;
        while nth < self.nleaves {
            let batch = SCAN_BATCH.min(self.nleaves - nth);
            let mut extent = Extent::alloc(self.leaf_base + nth, batch)?;
            extent.submit_read(&self.region)?;

            for (leaf, buf) in extent.into_bufs().into_iter().enumerate() {
                let page = MapPage::from_buf(buf, KIND_LEAF)?;
                for slot in 0..ENTRIES_PER_PAGE {
                    let lbn = ((nth + leaf) * ENTRIES_PER_PAGE + slot) as u64;
                    if lbn >= self.logical_blocks {
                        break;
                    }
                    let loc = page.entry(slot)?;
                    if loc.is_mapped() {
                        visit(lbn, loc)?;
                    }
                }
            }
            nth += batch;
        }
        Ok(())
    }

    fn locate(&self, lbn: Lbn) -> Result<(BlockId, usize)> {
        if lbn >= self.logical_blocks {
            return_errno_with_msg!(OutOfRange, "LBN is beyond the logical space");
        }
        let page_no = self.leaf_base + lbn as usize / ENTRIES_PER_PAGE;
        Ok((page_no, lbn as usize % ENTRIES_PER_PAGE))
    }

    fn load_page(&self, cache: &mut LruCache<usize, MapPage>, page_no: BlockId) -> Result<()> {
        if cache.get(&page_no).is_none() {
            let mut buf = Buf::alloc(1)?;
            self.region.read(page_no, buf.as_mut())?;
            let page = MapPage::from_buf(buf, KIND_LEAF)?;
            cache.put(page_no, page);
        }
        Ok(())
    }
}

impl<D> Debug for BlockMap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMap")
            .field("logical_blocks", &self.logical_blocks)
            .field("nleaves", &self.nleaves)
            .field("nzones", &self.zones.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{bio::MemDisk, map::MappingState};

    fn new_map(logical_blocks: u64, nzones: usize) -> BlockMap<MemDisk> {
        let region = MemDisk::create(BlockMap::<MemDisk>::required_blocks(logical_blocks)).unwrap();
        BlockMap::format(&region, logical_blocks).unwrap();
        BlockMap::open(region, logical_blocks, nzones, 4).unwrap()
    }

    #[test]
    fn fresh_map_is_unmapped() {
        let map = new_map(10_000, 2);
        for lbn in [0u64, 1, 815, 816, 9_999] {
            assert_eq!(map.get_mapped(lbn).unwrap(), DataLocation::UNMAPPED);
        }
        assert!(map.get_mapped(10_000).is_err());
    }

    #[test]
    fn put_then_get_across_pages() {
        let map = new_map(10_000, 2);
        map.put_mapped(3, DataLocation::uncompressed(77)).unwrap();
        map.put_mapped(2_000, DataLocation::compressed(78, 5)).unwrap();

        assert_eq!(map.get_mapped(3).unwrap(), DataLocation::uncompressed(77));
        let loc = map.get_mapped(2_000).unwrap();
        assert_eq!(loc.pbn, 78);
        assert_eq!(loc.state, MappingState::Compressed(5));
        assert_eq!(map.get_mapped(4).unwrap(), DataLocation::UNMAPPED);
    }

    #[test]
    fn write_through_survives_reopen() {
        let region =
            MemDisk::create(BlockMap::<MemDisk>::required_blocks(2_000)).unwrap();
        BlockMap::format(&region, 2_000).unwrap();
        {
            let map = BlockMap::open(region.clone(), 2_000, 1, 4).unwrap();
            map.put_mapped(42, DataLocation::uncompressed(9)).unwrap();
        }
        let map = BlockMap::open(region, 2_000, 1, 4).unwrap();
        assert_eq!(map.get_mapped(42).unwrap(), DataLocation::uncompressed(9));
    }

    #[test]
    fn scan_visits_only_mapped() {
        let map = new_map(5_000, 2);
        map.put_mapped(1, DataLocation::uncompressed(11)).unwrap();
        map.put_mapped(4_321, DataLocation::uncompressed(12)).unwrap();

        let mut seen = Vec::new();
        map.scan_mapped(|lbn, loc| {
            seen.push((lbn, loc.pbn));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(1, 11), (4_321, 12)]);
    }

    #[test]
    fn leaf_zone_partitioning() {
        let map = new_map(10_000, 3);
        // All LBNs of one leaf page share a zone.
        assert_eq!(map.zone_of(0), map.zone_of(815));
        // Consecutive leaf pages rotate zones.
        assert_ne!(map.zone_of(0), map.zone_of(816));
    }
}
