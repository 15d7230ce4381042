//! Counting limiter for outbound transfers in flight
//!
//! A permit is taken before a write allocates its buffer and travels with the
//! transfer into its completion callback. Dropping the permit returns the
//! slot, whichever way the transfer ends.

use crate::access::lock;
use crate::interrupt::InterruptFlag;
use protocol::{DriverError, Result};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Bounded counting limiter
#[derive(Debug)]
pub(crate) struct Limiter {
    capacity: usize,
    available: Mutex<usize>,
    freed: Condvar,
}

impl Limiter {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            available: Mutex::new(capacity),
            freed: Condvar::new(),
        })
    }

    /// Take a slot, sleeping until one frees up or the caller is interrupted
    pub(crate) fn acquire(self: &Arc<Self>, interrupt: &InterruptFlag) -> Result<Permit> {
        let mut available = lock(&self.available);
        while *available == 0 {
            if interrupt.take() {
                return Err(DriverError::Interrupted);
            }
            available = self
                .freed
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;
        Ok(Permit {
            limiter: Arc::clone(self),
        })
    }

    /// Take a slot only if one is free right now
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut available = lock(&self.available);
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit {
            limiter: Arc::clone(self),
        })
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.capacity - *lock(&self.available)
    }

    pub(crate) fn wake(&self) {
        let _available = lock(&self.available);
        self.freed.notify_all();
    }

    fn release(&self) {
        let mut available = lock(&self.available);
        debug_assert!(*available < self.capacity, "limiter over-released");
        *available += 1;
        self.freed.notify_all();
    }
}

/// One in-flight slot; released on drop
#[derive(Debug)]
pub(crate) struct Permit {
    limiter: Arc<Limiter>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
