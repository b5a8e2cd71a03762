// SPDX-License-Identifier: MPL-2.0

//! A block-level deduplicating, compressing virtual storage device.
//!
//! `DedupDisk` exposes a fixed-size logical block address space and maps
//! logical blocks onto a smaller pool of physical blocks on an underlying
//! `BlockSet`. Every incoming write is inspected for zero content, hashed,
//! checked against a deduplication index, optionally compressed, and either
//! shared with an existing physical block or written to a freshly allocated
//! one. Reads translate a logical block number to a physical block, possibly
//! decompress a packed fragment, and return the data.

#![deny(unsafe_code)]
#![allow(dead_code, unused_imports)]

mod error;
mod layers;
mod os;
mod prelude;
mod util;

pub use self::{
    error::{Errno, Error},
    layers::{
        bio::{BlockId, BlockSet, Buf, BufMut, BufRef, MemDisk, BLOCK_SIZE, SECTOR_SIZE},
        dedup::{DedupIndex, Fingerprint, MemIndex},
        disk::{BioFlags, BioReq, BioReqBuilder, BioType, DedupDisk, DiskConfig, Statistics},
        map::{DataLocation, Lbn, MappingState, Pbn, ZERO_BLOCK},
    },
};
