//! Sticky single-slot fault store
//!
//! Completions record transport faults here; the next caller that takes the
//! latch receives the fault and clears it. The slot is a single atomic byte,
//! so setting it from completion context never blocks.

use protocol::Fault;
use std::sync::atomic::{AtomicU8, Ordering};

const NONE: u8 = 0;

/// Single-slot fault latch
#[derive(Debug, Default)]
pub struct ErrorLatch {
    slot: AtomicU8,
}

impl ErrorLatch {
    /// Create an empty latch
    pub fn new() -> Self {
        Self {
            slot: AtomicU8::new(NONE),
        }
    }

    /// Record a fault, replacing whatever was there
    pub fn set(&self, fault: Fault) {
        self.slot.store(fault.code(), Ordering::Release);
    }

    /// Take the recorded fault, leaving the latch empty
    pub fn take(&self) -> Option<Fault> {
        Fault::from_code(self.slot.swap(NONE, Ordering::AcqRel))
    }

    /// Look at the recorded fault without consuming it
    pub fn peek(&self) -> Option<Fault> {
        Fault::from_code(self.slot.load(Ordering::Acquire))
    }
}
