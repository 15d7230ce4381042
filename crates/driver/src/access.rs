//! Sleeping lock with interruptible acquisition
//!
//! Serializes interface binding, transfer submission, and lifecycle
//! transitions. Unlike a `std::sync::Mutex` guard, ownership can outlive the
//! call that took it: the pre-reset hook takes the lock and the post-reset hook
//! releases it.

use crate::interrupt::InterruptFlag;
use protocol::{DriverError, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sleeping access lock
#[derive(Debug)]
pub(crate) struct AccessLock {
    name: &'static str,
    locked: Mutex<bool>,
    released: Condvar,
}

impl AccessLock {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    /// Acquire, sleeping as long as it takes
    pub(crate) fn lock(&self) -> AccessGuard<'_> {
        let mut locked = lock(&self.locked);
        while *locked {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
        AccessGuard { lock: self }
    }

    /// Acquire, giving up if the caller is interrupted while sleeping
    pub(crate) fn lock_interruptible(&self, interrupt: &InterruptFlag) -> Result<AccessGuard<'_>> {
        let mut locked = lock(&self.locked);
        while *locked {
            if interrupt.take() {
                return Err(DriverError::Interrupted);
            }
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
        Ok(AccessGuard { lock: self })
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        *lock(&self.locked)
    }

    /// Release a lock whose guard was converted with [`AccessGuard::hold`]
    ///
    /// Returns false if the lock was not held.
    pub(crate) fn release_held(&self) -> bool {
        let mut locked = lock(&self.locked);
        if !*locked {
            warn!("Releasing {} lock that is not held", self.name);
            return false;
        }
        *locked = false;
        self.released.notify_all();
        true
    }

    /// Wake sleepers so they can notice an interrupt
    pub(crate) fn wake(&self) {
        let _locked = lock(&self.locked);
        self.released.notify_all();
    }

    fn release(&self) {
        let mut locked = lock(&self.locked);
        *locked = false;
        self.released.notify_all();
    }
}

/// Ownership of an [`AccessLock`]; releases on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub(crate) struct AccessGuard<'a> {
    lock: &'a AccessLock,
}

impl AccessGuard<'_> {
    /// Keep the lock held past this guard; see [`AccessLock::release_held`]
    pub(crate) fn hold(self) {
        std::mem::forget(self);
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_guard_releases() {
        let lock = AccessLock::new("test");
        {
            let _guard = lock.lock();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_hold_and_release() {
        let lock = AccessLock::new("test");
        lock.lock().hold();
        assert!(lock.is_locked());
        assert!(lock.release_held());
        assert!(!lock.is_locked());
        assert!(!lock.release_held());
    }

    #[test]
    fn test_contended_lock_waits() {
        let lock = Arc::new(AccessLock::new("test"));
        let acquired = Arc::new(AtomicBool::new(false));

        lock.lock().hold();

        let waiter = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _guard = lock.lock();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        lock.release_held();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_interruptible_acquire() {
        let lock = Arc::new(AccessLock::new("test"));
        let flag = InterruptFlag::default();
        lock.lock().hold();

        let waiter = {
            let lock = Arc::clone(&lock);
            let flag = flag.clone();
            thread::spawn(move || lock.lock_interruptible(&flag).map(|g| g.hold()))
        };

        thread::sleep(Duration::from_millis(20));
        flag.raise();
        lock.wake();

        assert_eq!(waiter.join().unwrap(), Err(DriverError::Interrupted));
        assert!(lock.release_held());
    }

    #[test]
    fn test_free_lock_ignores_interrupt() {
        let lock = AccessLock::new("test");
        let flag = InterruptFlag::default();
        flag.raise();
        assert!(lock.lock_interruptible(&flag).is_ok());
        // The flag was not consumed because no wait happened
        assert!(flag.take());
    }
}
