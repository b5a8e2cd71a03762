// SPDX-License-Identifier: MPL-2.0

//! The layer of the virtual device itself.
//!
//! `DedupDisk` exposes the classic block I/O surface, `submit_bio()`,
//! `read()`, `write()`, `discard()` and `sync()`, and runs every request
//! through the zoned data-VIO pipeline: zero-check, fingerprint, dedup,
//! compression and packing, allocation, journaling, and the block-map
//! update.
//!
//! # Usage Example
//!
//! Write, then read blocks from a `DedupDisk`.
//!
//! ```ignore
//! let device = MemDisk::create(8 * 1024)?;
//! let disk = DedupDisk::create(device, DiskConfig::default(), Arc::new(MemIndex::new()))?;
//!
//! let mut buf = Buf::alloc(1)?;
//! buf.as_mut_slice().fill(0x5a);
//! disk.write(0, buf.as_ref())?;
//! disk.sync()?;
//! disk.read(0, buf.as_mut())?;
//! ```

mod bio;
mod compression;
mod data_vio;
mod dedup_disk;
mod packer;
mod pool;
mod super_block;
mod zone;

pub use self::{
    bio::{BioFlags, BioReq, BioReqBuilder, BioResp, BioType},
    dedup_disk::{DedupDisk, DiskConfig, Statistics},
};
