// SPDX-License-Identifier: MPL-2.0

//! Batched metadata I/O.

use super::{BlockId, BlockSet, Buf};
use crate::prelude::*;

/// A batch of consecutive block buffers submitted against a contiguous
/// block range as one logical I/O.
///
/// The buffers may be scattered in memory; the sub-I/Os complete as a unit
/// and the first non-success status is the status of the whole extent.
pub struct Extent {
    start: BlockId,
    bufs: Vec<Buf>,
}

impl Extent {
    /// Create an extent of `nblocks` zeroed single-block buffers starting
    /// at block `start`.
    pub fn alloc(start: BlockId, nblocks: usize) -> Result<Self> {
        if nblocks == 0 {
            return_errno_with_msg!(InvalidArgs, "an extent must cover at least one block");
        }
        let mut bufs = Vec::with_capacity(nblocks);
        for _ in 0..nblocks {
            bufs.push(Buf::alloc(1)?);
        }
        Ok(Self { start, bufs })
    }

    /// Create an extent over caller-provided single-block buffers.
    pub fn with_bufs(start: BlockId, bufs: Vec<Buf>) -> Result<Self> {
        if bufs.is_empty() {
            return_errno_with_msg!(InvalidArgs, "an extent must cover at least one block");
        }
        if bufs.iter().any(|buf| buf.nblocks() != 1) {
            return_errno_with_msg!(InvalidArgs, "extent buffers must be single blocks");
        }
        Ok(Self { start, bufs })
    }

    /// The first block of the covered range.
    pub fn start(&self) -> BlockId {
        self.start
    }

    /// The number of blocks covered.
    pub fn nblocks(&self) -> usize {
        self.bufs.len()
    }

    /// Access the `nth` buffer.
    pub fn block(&self, nth: usize) -> &Buf {
        &self.bufs[nth]
    }

    /// Access the `nth` buffer mutably.
    pub fn block_mut(&mut self, nth: usize) -> &mut Buf {
        &mut self.bufs[nth]
    }

    /// Submit all sub-writes; return once every one has completed,
    /// reporting the first non-success status.
    pub fn submit_write<D: BlockSet>(&self, disk: &D) -> Result<()> {
        let mut first_error = None;
        for (nth, buf) in self.bufs.iter().enumerate() {
            let res = disk.write(self.start + nth, buf.as_ref());
            if let Err(e) = res {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Submit all sub-reads; return once every one has completed,
    /// reporting the first non-success status.
    pub fn submit_read<D: BlockSet>(&mut self, disk: &D) -> Result<()> {
        let mut first_error = None;
        for (nth, buf) in self.bufs.iter_mut().enumerate() {
            let res = disk.read(self.start + nth, buf.as_mut());
            if let Err(e) = res {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Consume the extent and return its buffers.
    pub fn into_bufs(self) -> Vec<Buf> {
        self.bufs
    }
}

#[cfg(test)]
mod tests {
    use super::Extent;
    use crate::layers::bio::{BlockSet, Buf, MemDisk};

    #[test]
    fn extent_write_then_read() {
        let disk = MemDisk::create(8).unwrap();

        let mut extent = Extent::alloc(2, 3).unwrap();
        for nth in 0..3 {
            extent.block_mut(nth).as_mut_slice().fill(nth as u8 + 1);
        }
        extent.submit_write(&disk).unwrap();

        let mut readback = Extent::alloc(2, 3).unwrap();
        readback.submit_read(&disk).unwrap();
        for nth in 0..3 {
            assert_eq!(readback.block(nth).as_slice()[0], nth as u8 + 1);
        }
    }

    #[test]
    fn extent_aggregates_first_error() {
        let disk = MemDisk::create(4).unwrap();
        // Covers blocks [2, 6): the last two sub-I/Os fail.
        let extent = Extent::alloc(2, 4).unwrap();
        assert!(extent.submit_write(&disk).is_err());

        let mut buf = Buf::alloc(1).unwrap();
        // The in-range sub-I/Os still completed.
        disk.read(3, buf.as_mut()).unwrap();
    }
}
