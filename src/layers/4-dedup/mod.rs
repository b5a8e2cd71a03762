// SPDX-License-Identifier: MPL-2.0

//! The layer of content-addressed deduplication: fingerprints, the
//! advice index boundary, and the per-fingerprint hash locks.

mod advice;
mod fingerprint;
mod hash_lock;

pub use self::{
    advice::{DedupIndex, MemIndex, QueryOutcome},
    fingerprint::Fingerprint,
    hash_lock::{AcquireRole, HashLockState, HashZone, ReleaseOutcome},
};
