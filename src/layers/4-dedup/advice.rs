// SPDX-License-Identifier: MPL-2.0

//! The boundary to the external dedup-advice index.
//!
//! The index maps chunk names to hints: a candidate physical location
//! believed to hold data with that name. Advice is advisory only; the
//! engine always verifies candidate bytes before sharing. Posts and
//! updates are fire-and-forget; queries carry a deadline, and a query
//! that misses its deadline is answered with "no advice".

use core::time::Duration;

use super::fingerprint::Fingerprint;
use crate::{
    layers::map::DataLocation,
    os::{HashMap, Mutex},
    prelude::*,
};

/// The outcome of an advice query.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueryOutcome {
    /// A candidate location believed to hold this content.
    Advice(DataLocation),
    /// The index has no entry for this name.
    NoAdvice,
    /// The index did not answer before the deadline.
    Timeout,
    /// The index transport failed.
    Error,
}

/// The operations the engine needs from a dedup index.
pub trait DedupIndex: Send + Sync {
    /// Record that `location` now holds content named `name`.
    fn post(&self, name: &Fingerprint, location: DataLocation);

    /// Ask for a candidate location for `name`.
    fn query(&self, name: &Fingerprint, deadline: Duration) -> QueryOutcome;

    /// Replace stale advice for `name` with `location`.
    fn update(&self, name: &Fingerprint, location: DataLocation);
}

/// An in-memory index. Answers instantly, so its deadline never lapses.
pub struct MemIndex {
    entries: Mutex<HashMap<Fingerprint, DataLocation>>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The number of names the index knows.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the index knows no names.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupIndex for MemIndex {
    fn post(&self, name: &Fingerprint, location: DataLocation) {
        self.entries.lock().entry(*name).or_insert(location);
    }

    fn query(&self, name: &Fingerprint, _deadline: Duration) -> QueryOutcome {
        match self.entries.lock().get(name) {
            Some(location) => QueryOutcome::Advice(*location),
            None => QueryOutcome::NoAdvice,
        }
    }

    fn update(&self, name: &Fingerprint, location: DataLocation) {
        self.entries.lock().insert(*name, location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(fill: u8) -> Fingerprint {
        Fingerprint::of_block(&vec![fill; BLOCK_SIZE])
    }

    #[test]
    fn query_follows_post_and_update() {
        let index = MemIndex::new();
        let deadline = Duration::from_millis(100);
        assert_eq!(index.query(&name(1), deadline), QueryOutcome::NoAdvice);

        index.post(&name(1), DataLocation::uncompressed(7));
        assert_eq!(
            index.query(&name(1), deadline),
            QueryOutcome::Advice(DataLocation::uncompressed(7))
        );

        // A post does not clobber existing advice; an update does.
        index.post(&name(1), DataLocation::uncompressed(8));
        assert_eq!(
            index.query(&name(1), deadline),
            QueryOutcome::Advice(DataLocation::uncompressed(7))
        );
        index.update(&name(1), DataLocation::uncompressed(9));
        assert_eq!(
            index.query(&name(1), deadline),
            QueryOutcome::Advice(DataLocation::uncompressed(9))
        );
    }
}
