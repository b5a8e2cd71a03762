// SPDX-License-Identifier: MPL-2.0

//! The packer: bins compressed fragments into shared physical blocks.
//!
//! The packer keeps a bounded set of open bins, each staging up to
//! fourteen fragments whose bytes must fit one physical block alongside
//! the fragment header. An arriving fragment goes to the open bin with
//! the tightest fit; when nothing fits and no bin slot is free, the
//! fullest bin is closed to make room. Closed bins are handed back to
//! the caller, which writes them out and sends every participant on its
//! way with a `(PBN, slot)` mapping.

use super::{
    compression::{MAX_FRAGMENT_SIZE, PACKED_HEADER_SIZE},
    data_vio::DataVio,
};
use crate::{layers::map::MAX_COMPRESSION_SLOTS, prelude::*};

/// Fragment bytes an empty bin can hold.
const BIN_CAPACITY: usize = BLOCK_SIZE - PACKED_HEADER_SIZE;

/// One staging bin.
struct Bin {
    free_space: usize,
    fragments: Vec<Box<DataVio>>,
}

impl Bin {
    fn new() -> Self {
        Self {
            free_space: BIN_CAPACITY,
            fragments: Vec::with_capacity(MAX_COMPRESSION_SLOTS),
        }
    }

    fn fits(&self, size: usize) -> bool {
        self.fragments.len() < MAX_COMPRESSION_SLOTS && self.free_space >= size
    }

    fn push(&mut self, vio: Box<DataVio>) {
        debug_assert!(self.fits(vio.compressed_size));
        self.free_space -= vio.compressed_size;
        self.fragments.push(vio);
    }

    fn used(&self) -> usize {
        BIN_CAPACITY - self.free_space
    }
}

/// A bin ready to be written out.
pub(super) struct ClosedBin {
    /// The participants, in slot order.
    pub vios: Vec<Box<DataVio>>,
}

/// The packer state, owned by the packer zone.
pub(super) struct Packer {
    bins: Vec<Bin>,
}

impl Packer {
    pub fn new() -> Self {
        Self { bins: Vec::new() }
    }

    /// Stage one fragment. Returns any bin that had to be closed to make
    /// room.
    pub fn add(&mut self, vio: Box<DataVio>) -> Option<ClosedBin> {
        debug_assert!(vio.compressed_size <= MAX_FRAGMENT_SIZE);

        // Best fit: the open bin with the least free space that still
        // takes the fragment.
        let best = self
            .bins
            .iter()
            .enumerate()
            .filter(|(_, bin)| bin.fits(vio.compressed_size))
            .min_by_key(|(_, bin)| bin.free_space)
            .map(|(nth, _)| nth);
        if let Some(nth) = best {
            self.bins[nth].push(vio);
            return None;
        }

        if self.bins.len() < MAX_COMPRESSION_SLOTS {
            let mut bin = Bin::new();
            bin.push(vio);
            self.bins.push(bin);
            return None;
        }

        // Nothing fits and no bin slot is free: close the fullest bin
        // and stage the fragment in its place.
        let fullest = self
            .bins
            .iter()
            .enumerate()
            .max_by_key(|(_, bin)| bin.used())
            .map(|(nth, _)| nth)
            .unwrap();
        let closed = core::mem::replace(&mut self.bins[fullest], Bin::new());
        self.bins[fullest].push(vio);
        Some(ClosedBin {
            vios: closed.fragments,
        })
    }

    /// Close every non-empty bin; used on flush and drain.
    pub fn flush(&mut self) -> Vec<ClosedBin> {
        let mut closed = Vec::new();
        for bin in self.bins.drain(..) {
            if !bin.fragments.is_empty() {
                closed.push(ClosedBin {
                    vios: bin.fragments,
                });
            }
        }
        closed
    }

    /// Cancel a staged fragment, pulling its data-VIO back out. The
    /// first canceller wins; a bin emptied by cancellation is discarded.
    pub fn remove(&mut self, pool_slot: usize) -> Option<Box<DataVio>> {
        for nth in 0..self.bins.len() {
            if let Some(pos) = self.bins[nth]
                .fragments
                .iter()
                .position(|vio| vio.pool_slot == pool_slot)
            {
                let vio = self.bins[nth].fragments.remove(pos);
                self.bins[nth].free_space += vio.compressed_size;
                if self.bins[nth].fragments.is_empty() {
                    self.bins.remove(nth);
                }
                return Some(vio);
            }
        }
        None
    }

    /// The number of staged fragments across all open bins.
    pub fn staged(&self) -> usize {
        self.bins.iter().map(|bin| bin.fragments.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vio_with_fragment(slot: usize, size: usize) -> Box<DataVio> {
        let mut vio = Box::new(DataVio::new(slot).unwrap());
        vio.compressed_size = size;
        vio.compressed = vec![0xab; size];
        vio
    }

    #[test]
    fn small_fragments_share_a_bin() {
        let mut packer = Packer::new();
        assert!(packer.add(vio_with_fragment(0, 1000)).is_none());
        assert!(packer.add(vio_with_fragment(1, 1000)).is_none());
        assert!(packer.add(vio_with_fragment(2, 1000)).is_none());
        assert_eq!(packer.staged(), 3);

        let closed = packer.flush();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].vios.len(), 3);
        assert!(packer.flush().is_empty());
    }

    #[test]
    fn best_fit_prefers_fuller_bins() {
        let mut packer = Packer::new();
        // First bin nearly full, second bin roomy.
        packer.add(vio_with_fragment(0, 2000));
        packer.add(vio_with_fragment(1, 1900));
        packer.add(vio_with_fragment(2, 500));

        // 100 bytes fit the first bin (free = 2040 - 2000 + ... ); the
        // tightest fit wins, which is the fuller of the two bins.
        packer.add(vio_with_fragment(3, 100));
        let closed = packer.flush();
        let sizes: Vec<usize> = closed.iter().map(|bin| bin.vios.len()).collect();
        assert_eq!(closed.len(), 2);
        assert!(sizes.contains(&3));
    }

    #[test]
    fn overflow_closes_the_fullest_bin() {
        let mut packer = Packer::new();
        // Two maximum-size fragments exactly fill a bin; saturate every
        // bin slot.
        for slot in 0..2 * MAX_COMPRESSION_SLOTS {
            assert!(packer.add(vio_with_fragment(slot, MAX_FRAGMENT_SIZE)).is_none());
        }
        assert_eq!(packer.staged(), 2 * MAX_COMPRESSION_SLOTS);

        // Nothing fits and no bin slot is free: a full bin must close.
        let closed = packer.add(vio_with_fragment(99, MAX_FRAGMENT_SIZE));
        let closed = closed.expect("a bin should have been closed");
        assert_eq!(closed.vios.len(), 2);
        assert_eq!(packer.staged(), 2 * MAX_COMPRESSION_SLOTS - 1);
    }

    #[test]
    fn cancellation_pulls_a_fragment_back() {
        let mut packer = Packer::new();
        packer.add(vio_with_fragment(7, 800));
        packer.add(vio_with_fragment(8, 800));

        let vio = packer.remove(7).unwrap();
        assert_eq!(vio.pool_slot, 7);
        assert_eq!(packer.staged(), 1);
        assert!(packer.remove(7).is_none());

        // Removing the last fragment discards the bin entirely.
        packer.remove(8).unwrap();
        assert_eq!(packer.staged(), 0);
        assert!(packer.flush().is_empty());
    }
}
