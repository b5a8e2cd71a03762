// SPDX-License-Identifier: MPL-2.0

//! The super block: device geometry and recovery bookkeeping, stored at
//! block 0.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

use crate::{
    layers::bio::{BlockSet, Buf},
    prelude::*,
};

const SUPER_BLOCK_MAGIC: u64 = 0x4445_4455_5044_4953;
const LAYOUT_VERSION: u32 = 1;

/// On-disk geometry and recovery state.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct SuperBlock {
    magic: u64,
    version: u32,
    pub uuid: [u8; 16],
    /// Size of the logical address space, in blocks.
    pub logical_blocks: u64,
    pub journal_start: u64,
    pub journal_blocks: u64,
    pub summary_start: u64,
    pub summary_blocks: u64,
    pub map_start: u64,
    pub map_blocks: u64,
    pub depot_start: u64,
    pub slab_count: u64,
    pub slab_blocks: u64,
    /// Journal blocks with a sequence at or past this point must be
    /// replayed on open; everything older is already reflected in the
    /// persisted metadata.
    pub journal_replay_from: u64,
}

impl SuperBlock {
    /// Lay out a fresh device.
    pub fn new(
        logical_blocks: u64,
        journal_blocks: u64,
        map_blocks: u64,
        slab_count: u64,
        slab_blocks: u64,
    ) -> Self {
        let journal_start = 1;
        let summary_start = journal_start + journal_blocks;
        let map_start = summary_start + 1;
        let depot_start = map_start + map_blocks;
        Self {
            magic: SUPER_BLOCK_MAGIC,
            version: LAYOUT_VERSION,
            uuid: Self::fresh_uuid(),
            logical_blocks,
            journal_start,
            journal_blocks,
            summary_start,
            summary_blocks: 1,
            map_start,
            map_blocks,
            depot_start,
            slab_count,
            slab_blocks,
            journal_replay_from: 1,
        }
    }

    /// Persist to block 0 of `device`.
    pub fn persist<D: BlockSet>(&self, device: &D) -> Result<()> {
        let bytes = postcard::to_allocvec(self)
            .map_err(|_| Error::with_msg(OutOfMemory, "super block serialization failed"))?;
        if bytes.len() > BLOCK_SIZE {
            return_errno_with_msg!(OutOfRange, "super block outgrew its block");
        }
        let mut buf = Buf::alloc(1)?;
        buf.as_mut_slice()[..bytes.len()].copy_from_slice(&bytes);
        device.write(0, buf.as_ref())
    }

    /// Load and validate from block 0 of `device`.
    pub fn load<D: BlockSet>(device: &D) -> Result<Self> {
        let mut buf = Buf::alloc(1)?;
        device.read(0, buf.as_mut())?;
        let sb: SuperBlock = postcard::from_bytes(buf.as_slice())
            .map_err(|_| Error::with_msg(Unrecoverable, "super block is corrupt"))?;
        if sb.magic != SUPER_BLOCK_MAGIC {
            return_errno_with_msg!(Unrecoverable, "super block magic mismatch");
        }
        if sb.version != LAYOUT_VERSION {
            return_errno_with_msg!(Unrecoverable, "unsupported layout version");
        }
        Ok(sb)
    }

    fn fresh_uuid() -> [u8; 16] {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        xxh3_128(&now.to_le_bytes()).to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::MemDisk;

    #[test]
    fn persist_and_load() {
        let device = MemDisk::create(4).unwrap();
        let sb = SuperBlock::new(1000, 16, 8, 4, 32);
        sb.persist(&device).unwrap();

        let loaded = SuperBlock::load(&device).unwrap();
        assert_eq!(loaded.uuid, sb.uuid);
        assert_eq!(loaded.logical_blocks, 1000);
        assert_eq!(loaded.journal_start, 1);
        assert_eq!(loaded.summary_start, 17);
        assert_eq!(loaded.map_start, 18);
        assert_eq!(loaded.depot_start, 26);
    }

    #[test]
    fn garbage_is_rejected() {
        let device = MemDisk::create(4).unwrap();
        assert!(SuperBlock::load(&device).is_err());
    }
}
