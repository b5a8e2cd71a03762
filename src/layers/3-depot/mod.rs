// SPDX-License-Identifier: MPL-2.0

//! The layer of physical allocation: slabs, reference counts, per-zone
//! allocators, and per-PBN locks.

mod depot;
mod pbn_lock;
mod ref_counts;
mod slab;

pub use self::{
    depot::{DepotConfig, SlabDepot},
    pbn_lock::{PbnLockMap, PbnLockType},
    ref_counts::{RefCounts, EMPTY, MAXIMUM, PROVISIONAL},
    slab::{Slab, SlabJournal, SlabJournalOp, SlabStatus},
};
