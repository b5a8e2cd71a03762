// SPDX-License-Identifier: MPL-2.0

//! The layer of logical-to-physical indirection.

mod block_map;
mod entry;

pub use self::{
    block_map::BlockMap,
    entry::{
        pack_entry, unpack_entry, DataLocation, MappingState, ENTRY_SIZE, MAX_COMPRESSION_SLOTS,
    },
};

/// Logical block number: an index into the device's logical address space.
pub type Lbn = u64;
/// Physical block number: an index into the backing device's data region.
pub type Pbn = u64;

/// The reserved zero block. It is never allocated, never reference-counted,
/// and never appears in a compressed mapping.
pub const ZERO_BLOCK: Pbn = 0;
