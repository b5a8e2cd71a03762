// SPDX-License-Identifier: MPL-2.0

//! OS-specific or OS-dependent APIs.

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

pub use hashbrown::{HashMap, HashSet};
pub use parking_lot::{
    Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::prelude::Result;

/// A `Condvar` (Condition Variable) is a synchronization primitive that can
/// block threads until a certain condition becomes true.
pub struct Condvar {
    inner: parking_lot::Condvar,
}

impl Condvar {
    /// Creates a new condition variable.
    pub fn new() -> Self {
        Condvar {
            inner: parking_lot::Condvar::new(),
        }
    }

    /// Atomically releases the given `MutexGuard`, blocking the current
    /// thread until the condition variable is notified, after which the
    /// mutex will be reacquired.
    pub fn wait<'a, T>(&self, mut guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
        self.inner.wait(&mut guard);
        Ok(guard)
    }

    /// Like `wait`, but gives up after `timeout`. Returns the reacquired
    /// guard and whether the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        mut guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> Result<(MutexGuard<'a, T>, bool)> {
        let res = self.inner.wait_for(&mut guard, timeout);
        Ok((guard, res.timed_out()))
    }

    /// Wakes up one blocked thread waiting on this condition variable.
    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    /// Wakes up all blocked threads waiting on this condition variable.
    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}

/// A mutex whose guards may be handed to `Condvar`.
#[repr(transparent)]
pub struct CvarMutex<T> {
    inner: Mutex<T>,
}

impl<T> CvarMutex<T> {
    /// Constructs a new `CvarMutex` lock.
    pub fn new(t: T) -> Self {
        Self {
            inner: Mutex::new(t),
        }
    }

    /// Acquires the lock and gives the caller access to the data protected by it.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        Ok(self.inner.lock())
    }
}

impl<T: fmt::Debug> fmt::Debug for CvarMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(guard) => f.debug_struct("CvarMutex").field("data", &&*guard).finish(),
            None => f.write_str("CvarMutex { <locked> }"),
        }
    }
}

/// Spawns a new thread, returning a `JoinHandle` for it.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let is_finished = std::sync::Arc::new(AtomicBool::new(false));

    let is_finished_clone = is_finished.clone();
    let handle = std::thread::spawn(move || {
        let data = f();
        is_finished_clone.store(true, Ordering::Release);
        data
    });

    JoinHandle {
        handle,
        is_finished,
    }
}

/// An owned permission to join on a thread (block on its termination).
///
/// This struct is created by the `spawn` function.
pub struct JoinHandle<T> {
    handle: std::thread::JoinHandle<T>,
    is_finished: std::sync::Arc<AtomicBool>,
}

impl<T> JoinHandle<T> {
    /// Checks if the associated thread has finished running its main function.
    pub fn is_finished(&self) -> bool {
        self.is_finished.load(Ordering::Acquire)
    }

    /// Waits for the associated thread to finish.
    pub fn join(self) -> Result<T> {
        self.handle
            .join()
            .map_err(|_| crate::Error::with_msg(crate::Errno::Protocol, "joined thread panicked"))
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condvar_wakeup() {
        let pair = std::sync::Arc::new((CvarMutex::new(false), Condvar::new()));
        let pair2 = pair.clone();

        let handle = spawn(move || {
            let (lock, cvar) = &*pair2;
            let mut started = lock.lock().unwrap();
            *started = true;
            cvar.notify_one();
        });

        let (lock, cvar) = &*pair;
        let mut started = lock.lock().unwrap();
        while !*started {
            started = cvar.wait(started).unwrap();
        }
        assert!(*started);
        drop(started);
        handle.join().unwrap();
    }
}
