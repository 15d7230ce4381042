//! Caller-initiated interruption of blocking waits
//!
//! Every open handle carries a flag. Raising it wakes every interruptible wait
//! on the device; the wait that observes the flag consumes it and fails with
//! [`DriverError::Interrupted`](protocol::DriverError::Interrupted).

use crate::device::Shared;
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Per-handle interrupt flag
#[derive(Debug, Clone, Default)]
pub(crate) struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume a raised flag
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sendable handle that interrupts the blocking calls of one open handle
///
/// Holds only a weak reference to the device, so an outstanding interrupter
/// never delays destruction.
pub struct Interrupter<T: Transport> {
    flag: InterruptFlag,
    device: Weak<Shared<T>>,
}

impl<T: Transport> Interrupter<T> {
    pub(crate) fn new(flag: InterruptFlag, device: &Arc<Shared<T>>) -> Self {
        Self {
            flag,
            device: Arc::downgrade(device),
        }
    }

    /// Interrupt the current (or next) blocking wait of the handle
    pub fn interrupt(&self) {
        self.flag.raise();
        if let Some(device) = self.device.upgrade() {
            trace!("Interrupting waiters");
            device.wake_waiters();
        }
    }
}

impl<T: Transport> Clone for Interrupter<T> {
    fn clone(&self) -> Self {
        Self {
            flag: self.flag.clone(),
            device: Weak::clone(&self.device),
        }
    }
}
