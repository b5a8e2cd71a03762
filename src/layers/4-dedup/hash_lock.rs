// SPDX-License-Identifier: MPL-2.0

//! Per-fingerprint hash locks.
//!
//! A hash zone owns a map from chunk name to hash lock. The first
//! data-VIO to arrive for a name becomes the lock's *agent* and makes
//! the dedup decision for everyone; same-name arrivals park as waiters
//! and inherit the agent's outcome. A lock is destroyed when its last
//! attached data-VIO lets go.
//!
//! The lock itself is a passive, zone-owned structure: the write
//! pipeline drives the state transitions from the hash zone's thread.

use hashbrown::HashMap;

use super::fingerprint::Fingerprint;
use crate::{
    layers::map::{DataLocation, Pbn},
    prelude::*,
};

/// Where a hash lock stands in the dedup decision.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashLockState {
    Initializing,
    Querying,
    Writing,
    Updating,
    Locking,
    Verifying,
    Bypassing,
    Unlocking,
    Destroying,
}

/// What a detach did to the lock.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReleaseOutcome {
    /// Other data-VIOs are still attached.
    Retained,
    /// The lock was destroyed; the candidate PBN lock (if any) must now
    /// be released by the caller.
    Destroyed(Option<Pbn>),
}

/// How an arriving data-VIO joins a lock.
pub enum AcquireRole<W> {
    /// The caller created the lock and owns the dedup decision.
    Agent(W),
    /// The decision is already made; the caller shares `duplicate`.
    Sharer(W, DataLocation),
    /// The lock gave up on dedup; the caller writes independently.
    Bypass(W),
    /// The caller was parked behind the agent.
    Parked,
}

struct HashLock<W> {
    state: HashLockState,
    waiters: VecDeque<W>,
    /// The candidate (later: decided) duplicate location.
    duplicate: Option<DataLocation>,
    /// Whether `duplicate` has been byte-verified.
    verified: bool,
    /// The PBN whose read lock the agent holds while verifying.
    duplicate_lock: Option<Pbn>,
    /// Data-VIOs attached: the agent, parked waiters, and sharers that
    /// have not released yet.
    reference_count: usize,
}

/// The hash-lock table of one hash zone.
pub struct HashZone<W> {
    locks: HashMap<Fingerprint, HashLock<W>>,
}

impl<W> HashZone<W> {
    pub fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    /// Attach a data-VIO to the lock for `name`, creating the lock if
    /// this is the first arrival.
    pub fn acquire(&mut self, name: Fingerprint, vio: W) -> AcquireRole<W> {
        match self.locks.get_mut(&name) {
            None => {
                self.locks.insert(
                    name,
                    HashLock {
                        state: HashLockState::Querying,
                        waiters: VecDeque::new(),
                        duplicate: None,
                        verified: false,
                        duplicate_lock: None,
                        reference_count: 1,
                    },
                );
                AcquireRole::Agent(vio)
            }
            Some(lock) => {
                lock.reference_count += 1;
                match lock.state {
                    // Late arrivals inherit a decided outcome without
                    // re-verifying.
                    HashLockState::Updating | HashLockState::Unlocking if lock.verified => {
                        AcquireRole::Sharer(vio, lock.duplicate.unwrap())
                    }
                    HashLockState::Bypassing => AcquireRole::Bypass(vio),
                    _ => {
                        lock.waiters.push_back(vio);
                        AcquireRole::Parked
                    }
                }
            }
        }
    }

    /// The current state of `name`'s lock.
    pub fn state(&self, name: &Fingerprint) -> Option<HashLockState> {
        self.locks.get(name).map(|lock| lock.state)
    }

    /// Move `name`'s lock to `state`.
    pub fn set_state(&mut self, name: &Fingerprint, state: HashLockState) {
        if let Some(lock) = self.locks.get_mut(name) {
            lock.state = state;
        }
    }

    /// Record the candidate the agent is pursuing.
    pub fn set_candidate(&mut self, name: &Fingerprint, candidate: DataLocation) {
        if let Some(lock) = self.locks.get_mut(name) {
            lock.duplicate = Some(candidate);
            lock.verified = false;
        }
    }

    /// Record the PBN read lock held on the candidate.
    pub fn set_duplicate_lock(&mut self, name: &Fingerprint, pbn: Pbn) {
        if let Some(lock) = self.locks.get_mut(name) {
            lock.duplicate_lock = Some(pbn);
        }
    }

    /// Surrender the candidate PBN lock for release.
    pub fn take_duplicate_lock(&mut self, name: &Fingerprint) -> Option<Pbn> {
        self.locks.get_mut(name).and_then(|lock| lock.duplicate_lock.take())
    }

    /// The agent decided: `duplicate` is the shared location for every
    /// attached data-VIO. Moves to UPDATING and hands back the parked
    /// waiters so the pipeline can relaunch them as sharers.
    pub fn resolve(&mut self, name: &Fingerprint, duplicate: DataLocation) -> Vec<W> {
        let Some(lock) = self.locks.get_mut(name) else {
            return Vec::new();
        };
        lock.state = HashLockState::Updating;
        lock.duplicate = Some(duplicate);
        lock.verified = true;
        lock.waiters.drain(..).collect()
    }

    /// The agent gave up on dedup for this name. Moves to BYPASSING and
    /// hands back the parked waiters to run as independent writers.
    pub fn bypass(&mut self, name: &Fingerprint) -> Vec<W> {
        let Some(lock) = self.locks.get_mut(name) else {
            return Vec::new();
        };
        lock.state = HashLockState::Bypassing;
        lock.duplicate = None;
        lock.verified = false;
        lock.waiters.drain(..).collect()
    }

    /// The decided duplicate, if any.
    pub fn duplicate(&self, name: &Fingerprint) -> Option<DataLocation> {
        self.locks.get(name).and_then(|lock| lock.duplicate)
    }

    /// Detach one data-VIO. The last detach destroys the lock and
    /// surrenders the candidate PBN lock, if one is still held.
    pub fn release(&mut self, name: &Fingerprint) -> ReleaseOutcome {
        let Some(lock) = self.locks.get_mut(name) else {
            debug_assert!(false, "released an absent hash lock");
            return ReleaseOutcome::Retained;
        };
        debug_assert!(lock.reference_count > 0);
        lock.reference_count -= 1;
        if lock.reference_count == 0 {
            debug_assert!(lock.waiters.is_empty());
            lock.state = HashLockState::Destroying;
            let duplicate_lock = lock.duplicate_lock.take();
            self.locks.remove(name);
            ReleaseOutcome::Destroyed(duplicate_lock)
        } else {
            ReleaseOutcome::Retained
        }
    }

    /// The number of live locks in this zone.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the zone has no live locks.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<W> Default for HashZone<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(fill: u8) -> Fingerprint {
        Fingerprint::of_block(&vec![fill; BLOCK_SIZE])
    }

    #[test]
    fn first_arrival_is_agent_rest_park() {
        let mut zone = HashZone::<u32>::new();
        let n = name(1);
        assert!(matches!(zone.acquire(n, 1), AcquireRole::Agent(1)));
        assert_eq!(zone.state(&n), Some(HashLockState::Querying));
        assert!(matches!(zone.acquire(n, 2), AcquireRole::Parked));
        assert!(matches!(zone.acquire(n, 3), AcquireRole::Parked));

        zone.set_state(&n, HashLockState::Writing);
        let woken = zone.resolve(&n, DataLocation::uncompressed(50));
        assert_eq!(woken, vec![2, 3]);
        assert_eq!(zone.state(&n), Some(HashLockState::Updating));
    }

    #[test]
    fn late_arrival_inherits_decision() {
        let mut zone = HashZone::<u32>::new();
        let n = name(2);
        assert!(matches!(zone.acquire(n, 1), AcquireRole::Agent(_)));
        zone.resolve(&n, DataLocation::uncompressed(9));

        match zone.acquire(n, 2) {
            AcquireRole::Sharer(2, loc) => assert_eq!(loc, DataLocation::uncompressed(9)),
            _ => panic!("expected a sharer"),
        }
    }

    #[test]
    fn bypass_releases_waiters_as_writers() {
        let mut zone = HashZone::<u32>::new();
        let n = name(3);
        assert!(matches!(zone.acquire(n, 1), AcquireRole::Agent(_)));
        assert!(matches!(zone.acquire(n, 2), AcquireRole::Parked));

        assert_eq!(zone.bypass(&n), vec![2]);
        assert!(matches!(zone.acquire(n, 3), AcquireRole::Bypass(3)));
    }

    #[test]
    fn last_release_destroys() {
        let mut zone = HashZone::<u32>::new();
        let n = name(4);
        assert!(matches!(zone.acquire(n, 1), AcquireRole::Agent(_)));
        zone.resolve(&n, DataLocation::uncompressed(5));
        assert!(matches!(zone.acquire(n, 2), AcquireRole::Sharer(..)));

        assert_eq!(zone.release(&n), ReleaseOutcome::Retained);
        assert_eq!(zone.release(&n), ReleaseOutcome::Destroyed(None));
        assert!(zone.is_empty());
    }

    #[test]
    fn duplicate_lock_travels_with_the_lock() {
        let mut zone = HashZone::<u32>::new();
        let n = name(5);
        assert!(matches!(zone.acquire(n, 1), AcquireRole::Agent(_)));
        zone.set_candidate(&n, DataLocation::uncompressed(77));
        zone.set_duplicate_lock(&n, 77);
        assert_eq!(zone.take_duplicate_lock(&n), Some(77));
        assert_eq!(zone.take_duplicate_lock(&n), None);
    }
}
