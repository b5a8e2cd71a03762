// SPDX-License-Identifier: MPL-2.0

use core::ops::Range;

use super::{Buf, BufMut, BufRef};
use crate::{error::Errno, os::Mutex, prelude::*};

/// A fixed set of data blocks that can support random reads and writes.
///
/// # Thread safety
///
/// `BlockSet` is a data structure of interior mutability.
/// It is ok to perform I/O on a `BlockSet` concurrently in multiple threads.
/// `BlockSet` promises the atomicity of reading and writing individual blocks.
pub trait BlockSet: Sync + Send {
    /// Read one or multiple blocks at a specified position.
    fn read(&self, pos: BlockId, buf: BufMut) -> Result<()>;

    /// Write one or multiple blocks at a specified position.
    fn write(&self, pos: BlockId, buf: BufRef) -> Result<()>;

    /// Get a subset of the blocks in the block set.
    fn subset(&self, range: Range<BlockId>) -> Result<Self>
    where
        Self: Sized;

    /// Ensure that blocks are persisted to the disk.
    fn flush(&self) -> Result<()>;

    /// Returns the number of blocks.
    fn nblocks(&self) -> usize;
}

impl<T: BlockSet> BlockSet for Arc<T> {
    fn read(&self, pos: BlockId, buf: BufMut) -> Result<()> {
        (**self).read(pos, buf)
    }

    fn write(&self, pos: BlockId, buf: BufRef) -> Result<()> {
        (**self).write(pos, buf)
    }

    fn subset(&self, range: Range<BlockId>) -> Result<Self> {
        (**self).subset(range).map(Arc::new)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }

    fn nblocks(&self) -> usize {
        (**self).nblocks()
    }
}

/// A disk that impl `BlockSet`.
///
/// The `region` is the accessible subset.
#[derive(Clone)]
pub struct MemDisk {
    disk: Arc<Mutex<Buf>>,
    region: Range<BlockId>,
}

impl MemDisk {
    /// Create a `MemDisk` with the number of blocks.
    pub fn create(num_blocks: usize) -> Result<Self> {
        let blocks = Buf::alloc(num_blocks)?;
        Ok(Self {
            disk: Arc::new(Mutex::new(blocks)),
            region: Range {
                start: 0,
                end: num_blocks,
            },
        })
    }
}

impl BlockSet for MemDisk {
    fn read(&self, pos: BlockId, mut buf: BufMut) -> Result<()> {
        if pos + buf.nblocks() > self.region.len() {
            return_errno_with_msg!(Errno::InvalidArgs, "read position is out of range");
        }
        let offset = (self.region.start + pos) * BLOCK_SIZE;
        let buf_len = buf.as_slice().len();

        let disk = self.disk.lock();
        buf.as_mut_slice()
            .copy_from_slice(&disk.as_slice()[offset..offset + buf_len]);
        Ok(())
    }

    fn write(&self, pos: BlockId, buf: BufRef) -> Result<()> {
        if pos + buf.nblocks() > self.region.len() {
            return_errno_with_msg!(Errno::InvalidArgs, "write position is out of range");
        }
        let offset = (self.region.start + pos) * BLOCK_SIZE;
        let buf_len = buf.as_slice().len();

        let mut disk = self.disk.lock();
        disk.as_mut_slice()[offset..offset + buf_len].copy_from_slice(buf.as_slice());
        Ok(())
    }

    fn subset(&self, range: Range<BlockId>) -> Result<Self> {
        if self.region.start + range.end > self.region.end {
            return_errno_with_msg!(Errno::InvalidArgs, "subset is out of range");
        }

        Ok(MemDisk {
            disk: self.disk.clone(),
            region: Range {
                start: self.region.start + range.start,
                end: self.region.start + range.end,
            },
        })
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn nblocks(&self) -> usize {
        self.region.len()
    }
}

#[cfg(test)]
mod tests {
    use core::ops::Range;

    use crate::layers::bio::{BlockSet, Buf, MemDisk};

    #[test]
    fn mem_disk() {
        let num_blocks = 64;
        let disk = MemDisk::create(num_blocks).unwrap();
        assert_eq!(disk.nblocks(), 64);

        let mut buf = Buf::alloc(1).unwrap();
        buf.as_mut_slice().fill(1);
        disk.write(32, buf.as_ref()).unwrap();

        let range = Range { start: 32, end: 64 };
        let subset = disk.subset(range).unwrap();
        assert_eq!(subset.nblocks(), 32);

        buf.as_mut_slice().fill(0);
        subset.read(0, buf.as_mut()).unwrap();
        assert_eq!(buf.as_ref().as_slice(), [1u8; 4096]);
    }
}
