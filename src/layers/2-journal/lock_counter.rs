// SPDX-License-Identifier: MPL-2.0

//! Reference counting of recovery-journal blocks.
//!
//! Each in-flight journal block is pinned while any metadata update it
//! records is still volatile. The journal zone owns one count per block;
//! every logical and physical zone owns one count per block as well, and
//! a per-zone-type atomic tracks how many *zones* currently hold any
//! reference. A cross-zone atomic decrement counter lets other zones
//! release journal-zone references without touching journal-zone state.
//!
//! # Memory ordering
//!
//! Zone counts are read with `Acquire`; a decrement that may produce the
//! release edge uses `Release` (via `AcqRel` on the RMW) so the edge
//! happens-before the notification it triggers. Per-zone counters are
//! only ever mutated by their owning zone and use `Relaxed`.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{os::Mutex, prelude::*};

/// The kinds of zone that may pin a journal block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ZoneType {
    Journal,
    Logical,
    Physical,
}

/// Callback invoked when a journal block may have become unpinned.
pub type UnlockNotification = Box<dyn Fn(usize) + Send + Sync>;

/// Per-journal-block lock counts across all zones.
pub struct LockCounter {
    locks: usize,
    journal_counters: Vec<AtomicU32>,
    journal_decrements: Vec<AtomicU32>,
    logical_zone_counts: Vec<AtomicU32>,
    physical_zone_counts: Vec<AtomicU32>,
    logical_counters: Vec<AtomicU32>,
    physical_counters: Vec<AtomicU32>,
    notifying: AtomicBool,
    on_unlock: Mutex<Option<UnlockNotification>>,
}

impl LockCounter {
    /// Create counters for `locks` in-flight journal blocks.
    pub fn new(locks: usize, logical_zones: usize, physical_zones: usize) -> Self {
        let make = |n: usize| (0..n).map(|_| AtomicU32::new(0)).collect::<Vec<_>>();
        Self {
            locks,
            journal_counters: make(locks),
            journal_decrements: make(locks),
            logical_zone_counts: make(locks),
            physical_zone_counts: make(locks),
            logical_counters: make(locks * logical_zones),
            physical_counters: make(locks * physical_zones),
            notifying: AtomicBool::new(false),
            on_unlock: Mutex::new(None),
        }
    }

    /// Install the owner callback fired on release edges.
    pub fn set_notification(&self, notification: UnlockNotification) {
        *self.on_unlock.lock() = Some(notification);
    }

    /// The number of lock slots.
    pub fn locks(&self) -> usize {
        self.locks
    }

    /// Reset the slot for reuse by a new journal block.
    ///
    /// Must only be called from the journal zone, on an unlocked slot.
    pub fn reset_lock(&self, lock: usize) {
        debug_assert!(self.is_unlocked(lock));
        self.journal_counters[lock].store(0, Ordering::Relaxed);
        self.journal_decrements[lock].store(0, Ordering::Relaxed);
    }

    /// Pin `lock` on behalf of the given zone.
    pub fn acquire(&self, lock: usize, zone_type: ZoneType, zone_id: usize) {
        match zone_type {
            ZoneType::Journal => {
                self.journal_counters[lock].fetch_add(1, Ordering::Relaxed);
            }
            ZoneType::Logical | ZoneType::Physical => {
                let counter = self.zone_counter(lock, zone_type, zone_id);
                let prev = counter.fetch_add(1, Ordering::Relaxed);
                if prev == 0 {
                    self.zone_count(lock, zone_type).fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }

    /// Release one reference taken by `acquire` from the same zone.
    pub fn release(&self, lock: usize, zone_type: ZoneType, zone_id: usize) {
        match zone_type {
            ZoneType::Journal => {
                let prev = self.journal_counters[lock].fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev > 0, "journal lock count underflow");
                if self.journal_value(lock) == 0 {
                    self.attempt_notification(lock);
                }
            }
            ZoneType::Logical | ZoneType::Physical => {
                let counter = self.zone_counter(lock, zone_type, zone_id);
                let prev = counter.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(prev > 0, "zone lock count underflow");
                if prev == 1 {
                    let zones_left =
                        self.zone_count(lock, zone_type).fetch_sub(1, Ordering::AcqRel);
                    debug_assert!(zones_left > 0, "zone count underflow");
                    if zones_left == 1 {
                        self.attempt_notification(lock);
                    }
                }
            }
        }
    }

    /// Release one journal-zone reference from outside the journal zone.
    pub fn release_journal_cross_zone(&self, lock: usize) {
        self.journal_decrements[lock].fetch_add(1, Ordering::AcqRel);
        if self.journal_value(lock) == 0 {
            self.attempt_notification(lock);
        }
    }

    /// Whether no zone of any type pins `lock`.
    pub fn is_unlocked(&self, lock: usize) -> bool {
        self.journal_value(lock) == 0
            && self.logical_zone_counts[lock].load(Ordering::Acquire) == 0
            && self.physical_zone_counts[lock].load(Ordering::Acquire) == 0
    }

    /// Permit the next release edge to notify again.
    pub fn acknowledge_unlock(&self) {
        self.notifying.store(false, Ordering::Release);
    }

    /// The effective journal-zone count: initialized value minus the
    /// cross-zone decrements.
    fn journal_value(&self, lock: usize) -> u32 {
        let raw = self.journal_counters[lock].load(Ordering::Acquire);
        let dec = self.journal_decrements[lock].load(Ordering::Acquire);
        debug_assert!(raw >= dec, "journal decrements exceed acquisitions");
        raw - dec
    }

    fn zone_counter(&self, lock: usize, zone_type: ZoneType, zone_id: usize) -> &AtomicU32 {
        match zone_type {
            ZoneType::Logical => &self.logical_counters[zone_id * self.locks + lock],
            ZoneType::Physical => &self.physical_counters[zone_id * self.locks + lock],
            ZoneType::Journal => unreachable!("the journal zone has no per-zone counters"),
        }
    }

    fn zone_count(&self, lock: usize, zone_type: ZoneType) -> &AtomicU32 {
        match zone_type {
            ZoneType::Logical => &self.logical_zone_counts[lock],
            ZoneType::Physical => &self.physical_zone_counts[lock],
            ZoneType::Journal => unreachable!("the journal zone has no zone count"),
        }
    }

    /// Fire the owner callback at most once per release edge.
    fn attempt_notification(&self, lock: usize) {
        if self
            .notifying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let guard = self.on_unlock.lock();
        if let Some(notify) = guard.as_ref() {
            notify(lock);
        } else {
            // No owner installed yet; clear the slot ourselves.
            self.notifying.store(false, Ordering::Release);
        }
    }
}

impl Debug for LockCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockCounter")
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}
