// SPDX-License-Identifier: MPL-2.0

//! The request pool and admission control.
//!
//! Data-VIOs are allocated once, up front; after admission nothing on
//! the data path allocates. Admission blocks the submitter cooperatively
//! when a permit is unavailable: a general permit bounds all in-flight
//! requests and a (smaller) discard permit bounds concurrent discards,
//! which are the metadata-heaviest requests.

use super::data_vio::DataVio;
use crate::{
    os::{Condvar, CvarMutex, Mutex},
    prelude::*,
};

/// A counting permit gate.
pub(super) struct Limiter {
    available: CvarMutex<usize>,
    released: Condvar,
}

impl Limiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            available: CvarMutex::new(capacity),
            released: Condvar::new(),
        }
    }

    /// Take one permit, blocking until one is available.
    pub fn acquire(&self) {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.released.wait(available).unwrap();
        }
        *available -= 1;
    }

    /// Return one permit.
    pub fn release(&self) {
        let mut available = self.available.lock().unwrap();
        *available += 1;
        self.released.notify_one();
    }

    /// The number of permits currently available.
    pub fn available(&self) -> usize {
        *self.available.lock().unwrap()
    }
}

/// The fixed pool of pre-allocated data-VIOs.
pub(super) struct VioPool {
    capacity: usize,
    free: Mutex<Vec<Box<DataVio>>>,
    general: Limiter,
    discard: Limiter,
}

impl VioPool {
    /// Pre-allocate `request_limit` data-VIOs.
    pub fn new(request_limit: usize, discard_limit: usize) -> Result<Self> {
        debug_assert!(request_limit > 0 && discard_limit > 0);
        let mut free = Vec::with_capacity(request_limit);
        for slot in 0..request_limit {
            free.push(Box::new(DataVio::new(slot)?));
        }
        Ok(Self {
            capacity: request_limit,
            free: Mutex::new(free),
            general: Limiter::new(request_limit),
            discard: Limiter::new(discard_limit),
        })
    }

    /// Admit one request and hand out a fresh data-VIO. Blocks until the
    /// permits are available.
    pub fn acquire(&self, discard: bool) -> Box<DataVio> {
        if discard {
            self.discard.acquire();
        }
        self.general.acquire();

        let mut vio = self
            .free
            .lock()
            .pop()
            .expect("the general permit guarantees a free data-VIO");
        vio.reset();
        vio.has_discard_permit = discard;
        vio
    }

    /// Return a data-VIO and its permits. Frees go back last-in,
    /// first-out so hot requests reuse warm entries.
    pub fn release(&self, mut vio: Box<DataVio>) {
        let had_discard_permit = vio.has_discard_permit;
        vio.reset();
        self.free.lock().push(vio);
        self.general.release();
        if had_discard_permit {
            self.discard.release();
        }
    }

    /// Outstanding requests, for drain accounting. Every admitted
    /// request owns exactly one pool entry.
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::spawn;

    #[test]
    fn permits_block_and_release() {
        let pool = Arc::new(VioPool::new(2, 1).unwrap());
        let a = pool.acquire(false);
        let b = pool.acquire(true);

        let pool2 = pool.clone();
        let waiter = spawn(move || {
            // Blocks until a permit frees up.
            let vio = pool2.acquire(false);
            pool2.release(vio);
        });

        std::thread::sleep(core::time::Duration::from_millis(10));
        assert!(!waiter.is_finished());

        pool.release(a);
        waiter.join().unwrap();
        pool.release(b);
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn discard_permits_are_scarcer() {
        let pool = VioPool::new(4, 1).unwrap();
        let a = pool.acquire(true);
        // A general request still gets in while the only discard permit
        // is out.
        let b = pool.acquire(false);
        pool.release(a);
        pool.release(b);
    }

    impl VioPool {
        fn free_len(&self) -> usize {
            self.free.lock().len()
        }
    }
}
