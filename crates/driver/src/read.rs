//! Inbound path
//!
//! A single reusable buffer serves every read. Only one inbound transfer is
//! ever outstanding: the buffer travels into the transfer on submit and comes
//! back through the completion callback.

use crate::access::{AccessLock, lock};
use crate::device::Shared;
use crate::interrupt::InterruptFlag;
use crate::transport::{BulkTransfer, Completion, SubmitError, Transport};
use protocol::{DriverError, READ_MAX_LENGTH, Result, TransferId};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Default)]
struct ReadState {
    /// The inbound buffer; `None` while it is inside a transfer
    buffer: Option<Vec<u8>>,
    in_flight: Option<TransferId>,
    /// Completion signal, re-armed on every submit
    done: bool,
    filled: usize,
}

/// How a wait on the completion signal ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Completed,
    TimedOut,
    Interrupted,
}

#[derive(Debug)]
pub(crate) struct ReadEngine {
    state: Mutex<ReadState>,
    signal: Condvar,
    /// Serializes readers; never held by anything else
    serial: AccessLock,
    capacity: usize,
}

impl ReadEngine {
    pub(crate) fn new(buffer: Option<Vec<u8>>) -> Self {
        let capacity = buffer.as_ref().map_or(0, Vec::len);
        Self {
            state: Mutex::new(ReadState {
                buffer,
                ..ReadState::default()
            }),
            signal: Condvar::new(),
            serial: AccessLock::new("reader"),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn in_flight(&self) -> Option<TransferId> {
        lock(&self.state).in_flight
    }

    /// Consume a completion that landed after the wait gave up
    ///
    /// Returns true when it brought data with it.
    fn take_late_delivery(&self) -> bool {
        let mut state = lock(&self.state);
        let delivered = state.done && state.filled > 0;
        state.done = false;
        delivered
    }

    /// Sleep until the outstanding transfer completes
    ///
    /// A completion that raced with the deadline or an interrupt still wins.
    pub(crate) fn wait(&self, timeout: Duration, interrupt: &InterruptFlag) -> Wait {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.done {
                state.done = false;
                return Wait::Completed;
            }
            if interrupt.take() {
                return Wait::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                return Wait::TimedOut;
            }
            state = self
                .signal
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Copy the bytes delivered by the last completion
    fn copy_filled(&self, out: &mut [u8]) -> usize {
        let state = lock(&self.state);
        match &state.buffer {
            Some(buffer) => {
                let n = state.filled.min(out.len());
                out[..n].copy_from_slice(&buffer[..n]);
                n
            }
            None => 0,
        }
    }

    /// Forget any uncollected completion
    pub(crate) fn clear_markers(&self) {
        let mut state = lock(&self.state);
        state.done = false;
        state.filled = 0;
    }

    pub(crate) fn wake(&self) {
        {
            let _state = lock(&self.state);
            self.signal.notify_all();
        }
        self.serial.wake();
    }
}

impl<T: Transport> Shared<T> {
    /// Deliver the payload of one inbound transfer into `buf`
    ///
    /// A zero return means no data arrived before the read timeout, or the
    /// request could not be served at all (zero or oversized `buf`, no
    /// inbound endpoint).
    pub(crate) fn read(self: &Arc<Self>, buf: &mut [u8], interrupt: &InterruptFlag) -> Result<usize> {
        let max_len = buf.len();
        let Some(endpoint) = self.endpoints.bulk_in else {
            return Ok(0);
        };
        if max_len == 0 || max_len > READ_MAX_LENGTH {
            return Ok(0);
        }
        if self.is_disconnecting() {
            return Err(DriverError::NotFound);
        }

        let _serial = self.reader.serial.lock_interruptible(interrupt)?;
        let io = self.io.lock_interruptible(interrupt)?;
        if !self.is_bound() {
            return Err(DriverError::NotFound);
        }

        self.submit_read(endpoint, max_len.min(self.reader.capacity()))?;
        drop(io);
        match self.reader.wait(self.config.read_timeout, interrupt) {
            Wait::Completed => {}
            outcome => {
                self.kill_read();
                if self.is_disconnecting() {
                    return Err(DriverError::NotFound);
                }
                // The transfer may have finished between the deadline and the cancel
                if !self.reader.take_late_delivery() {
                    return match outcome {
                        Wait::Interrupted => Err(DriverError::Interrupted),
                        _ => Ok(0),
                    };
                }
                debug!("Inbound transfer completed while being cancelled");
            }
        }

        if self.is_disconnecting() {
            return Err(DriverError::NotFound);
        }
        if let Some(fault) = self.errors.take() {
            debug!("Read reporting latched fault {:?}", fault);
            return Err(fault.into());
        }
        Ok(self.reader.copy_filled(buf))
    }

    /// Hand the inbound buffer to the transport; caller holds the io lock
    fn submit_read(self: &Arc<Self>, endpoint: u8, length: usize) -> Result<()> {
        if self.reader.in_flight().is_some() {
            // Left behind by a handle that closed mid-read
            debug!("Reclaiming orphaned inbound transfer");
            self.kill_read();
        }

        let id = self.next_transfer_id();
        let buffer = {
            let mut state = lock(&self.reader.state);
            let Some(buffer) = state.buffer.take() else {
                warn!("Inbound buffer missing with no transfer in flight");
                return Err(DriverError::NoMemory);
            };
            state.in_flight = Some(id);
            state.done = false;
            state.filled = 0;
            buffer
        };

        let device = Arc::clone(self);
        let transfer = BulkTransfer::new(
            id,
            endpoint,
            buffer,
            length,
            Box::new(move |completion| device.complete_read(completion)),
        );

        if let Err(SubmitError { error, transfer }) = self.transport.submit(transfer) {
            warn!("Inbound submit failed: {}", error);
            let mut state = lock(&self.reader.state);
            state.buffer = Some(transfer.into_buffer());
            state.in_flight = None;
            return Err(match error {
                DriverError::NoMemory => DriverError::NoMemory,
                _ => DriverError::Io,
            });
        }

        trace!("Submitted inbound transfer {:?} ({} bytes)", id, length);
        Ok(())
    }

    fn complete_read(&self, completion: Completion) {
        let fault = completion.status.fault();
        if let Some(fault) = fault {
            if !self.disconnecting.load(Ordering::Acquire) {
                warn!("Inbound transfer failed: {:?}", completion.status);
            }
            self.errors.set(fault);
        }

        let mut state = lock(&self.reader.state);
        if state.in_flight == Some(completion.id) {
            state.in_flight = None;
        }
        state.filled = match fault {
            Some(_) => 0,
            None => completion.actual_length,
        };
        state.buffer = Some(completion.buffer);
        state.done = true;
        self.reader.signal.notify_all();

        trace!(
            "Inbound transfer {:?} finished: {:?}, {} bytes",
            completion.id, completion.status, completion.actual_length
        );
    }

    /// Cancel the inbound transfer, if any, and wait for its callback
    pub(crate) fn kill_read(&self) {
        let victim = lock(&self.reader.state).in_flight;
        if let Some(id) = victim {
            self.transport.cancel(id);
            let mut state = lock(&self.reader.state);
            while state.in_flight == Some(id) {
                state = self
                    .reader
                    .signal
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            debug!("Inbound transfer {:?} cancelled", id);
        }
    }
}
