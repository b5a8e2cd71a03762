// SPDX-License-Identifier: MPL-2.0

//! The layer of crash recovery: the journal ring and the lock counter
//! that pins its blocks until recorded metadata is stable.

mod lock_counter;
mod recovery;

pub use self::{
    lock_counter::{LockCounter, UnlockNotification, ZoneType},
    recovery::{replay, JournalEntry, JournalPoint, RecoveryJournal, ENTRIES_PER_BLOCK},
};
