// SPDX-License-Identifier: MPL-2.0

//! The layer of raw block I/O.

mod block_buf;
mod block_set;
mod extent;

pub use self::{
    block_buf::{Buf, BufMut, BufRef},
    block_set::{BlockSet, MemDisk},
    extent::Extent,
};

pub type BlockId = usize;
pub const BLOCK_SIZE: usize = 0x1000;
pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / SECTOR_SIZE;
