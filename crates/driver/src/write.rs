//! Outbound path
//!
//! Writes are fire-and-forget: each call copies at most one chunk into a
//! fresh buffer, queues it, and returns. Faults show up on a later call
//! through the error latch.

use crate::anchor::Anchor;
use crate::device::Shared;
use crate::interrupt::InterruptFlag;
use crate::limiter::{Limiter, Permit};
use crate::transport::{BulkTransfer, Completion, Transport};
use protocol::{DriverError, Result, TransferId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug)]
pub(crate) struct WriteEngine {
    limiter: Arc<Limiter>,
    submitted: Anchor,
    chunk: usize,
}

impl WriteEngine {
    pub(crate) fn new(writes_in_flight: usize, chunk: usize) -> Self {
        Self {
            limiter: Limiter::new(writes_in_flight),
            submitted: Anchor::new(),
            chunk,
        }
    }

    /// Transfers submitted and not yet retired
    pub(crate) fn outstanding(&self) -> usize {
        self.submitted.len()
    }

    #[cfg(test)]
    pub(crate) fn slots_in_use(&self) -> usize {
        self.limiter.in_use()
    }

    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        self.submitted.wait_empty_timeout(timeout)
    }

    pub(crate) fn kill_all(&self, cancel: impl Fn(TransferId)) -> usize {
        self.submitted.kill_all(cancel)
    }

    pub(crate) fn wake(&self) {
        self.limiter.wake();
    }
}

impl<T: Transport> Shared<T> {
    /// Queue up to one chunk of `data`; returns the number of bytes accepted
    pub(crate) fn write(
        self: &Arc<Self>,
        data: &[u8],
        nonblocking: bool,
        interrupt: &InterruptFlag,
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let Some(endpoint) = self.endpoints.bulk_out else {
            return Err(DriverError::NotFound);
        };

        let permit = if nonblocking {
            self.writer
                .limiter
                .try_acquire()
                .ok_or(DriverError::TryAgain)?
        } else {
            self.writer.limiter.acquire(interrupt)?
        };

        if self.is_disconnecting() {
            return Err(DriverError::NotFound);
        }
        if let Some(fault) = self.errors.take() {
            debug!("Write reporting latched fault {:?}", fault);
            return Err(fault.into());
        }

        let length = data.len().min(self.writer.chunk);
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(length)
            .map_err(|_| DriverError::NoMemory)?;
        buffer.extend_from_slice(&data[..length]);

        let _io = self.io.lock();
        if !self.is_bound() {
            return Err(DriverError::NotFound);
        }

        let id = self.next_transfer_id();
        let device = Arc::clone(self);
        let transfer = BulkTransfer::new(
            id,
            endpoint,
            buffer,
            length,
            Box::new(move |completion| device.complete_write(completion, permit)),
        );

        self.writer.submitted.anchor(id);
        if let Err(err) = self.transport.submit(transfer) {
            warn!("Outbound submit failed: {}", err.error);
            // Releases the permit along with the callback
            drop(err.transfer);
            self.writer.submitted.unanchor(id);
            return Err(err.error);
        }

        trace!("Submitted outbound transfer {:?} ({} bytes)", id, length);
        Ok(length)
    }

    fn complete_write(&self, completion: Completion, permit: Permit) {
        if let Some(fault) = completion.status.fault() {
            if !self.is_disconnecting() {
                warn!("Outbound transfer failed: {:?}", completion.status);
            }
            self.errors.set(fault);
        }
        trace!(
            "Outbound transfer {:?} finished: {:?}, {} bytes",
            completion.id, completion.status, completion.actual_length
        );

        let Completion { id, buffer, .. } = completion;
        drop(buffer);
        self.writer.submitted.retire(id, permit);
    }
}
