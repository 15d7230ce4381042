//! The seam between the engine and the host controller
//!
//! A [`Transport`] accepts bulk transfers and later completes each one exactly
//! once by calling [`BulkTransfer::complete`] from its own execution context,
//! never from the thread that submitted it.

use protocol::{ControlRequest, Direction, DriverError, TransferId, TransferStatus};
use std::fmt;

/// Callback run when a transfer finishes
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Outcome of a bulk transfer, handed to its callback
#[derive(Debug)]
pub struct Completion {
    /// Transfer that finished
    pub id: TransferId,
    /// Final status
    pub status: TransferStatus,
    /// Bytes actually moved
    pub actual_length: usize,
    /// The transfer buffer, returned to its owner
    pub buffer: Vec<u8>,
}

/// A bulk transfer in the transport's custody
pub struct BulkTransfer {
    id: TransferId,
    endpoint: u8,
    buffer: Vec<u8>,
    length: usize,
    callback: CompletionFn,
}

impl BulkTransfer {
    pub(crate) fn new(
        id: TransferId,
        endpoint: u8,
        buffer: Vec<u8>,
        length: usize,
        callback: CompletionFn,
    ) -> Self {
        debug_assert!(length <= buffer.len());
        Self {
            id,
            endpoint,
            buffer,
            length,
            callback,
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Endpoint address, direction bit included
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.endpoint)
    }

    /// Number of bytes to move
    pub fn length(&self) -> usize {
        self.length
    }

    /// Outbound payload
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Landing area for inbound data
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.length]
    }

    /// Finish the transfer and run its callback on the current thread
    pub fn complete(self, status: TransferStatus, actual_length: usize) {
        let completion = Completion {
            id: self.id,
            status,
            actual_length: actual_length.min(self.length),
            buffer: self.buffer,
        };
        (self.callback)(completion);
    }

    pub(crate) fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

impl fmt::Debug for BulkTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkTransfer")
            .field("id", &self.id)
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// A submission the transport refused; the transfer is handed back unrun
#[derive(Debug)]
pub struct SubmitError {
    pub error: DriverError,
    pub transfer: BulkTransfer,
}

impl SubmitError {
    pub fn new(error: DriverError, transfer: BulkTransfer) -> Self {
        Self { error, transfer }
    }
}

/// Host-controller connection of one attached device
///
/// Contract:
/// - `submit` either returns the transfer inside a [`SubmitError`] without
///   ever running its callback, or takes custody and completes it exactly once.
/// - `cancel` is asynchronous and idempotent; unknown or finished ids are
///   ignored. A cancelled transfer still completes, normally with
///   [`TransferStatus::Cancelled`].
/// - Control requests are synchronous and independent of bulk traffic.
pub trait Transport: Send + Sync + 'static {
    /// Queue a bulk transfer
    fn submit(&self, transfer: BulkTransfer) -> Result<(), SubmitError>;

    /// Request cancellation of a submitted transfer
    fn cancel(&self, id: TransferId);

    /// Device-to-host control request; returns the reply length
    fn control_in(&self, request: ControlRequest, buf: &mut [u8])
    -> Result<usize, TransferStatus>;

    /// Host-to-device control request; returns the bytes sent
    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize, TransferStatus>;

    /// Bring the device out of any low-power state and keep it there
    fn power_get(&self) -> Result<(), DriverError> {
        Ok(())
    }

    /// Drop the hold taken by [`Transport::power_get`]
    fn power_put(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_complete_runs_callback() {
        let (tx, rx) = mpsc::channel();
        let transfer = BulkTransfer::new(
            TransferId(3),
            0x81,
            vec![0u8; 16],
            8,
            Box::new(move |c| tx.send(c).unwrap()),
        );
        assert_eq!(transfer.direction(), Direction::In);
        assert_eq!(transfer.length(), 8);

        transfer.complete(TransferStatus::Completed, 100);
        let completion = rx.recv().unwrap();
        assert_eq!(completion.id, TransferId(3));
        // Clamped to the requested length
        assert_eq!(completion.actual_length, 8);
        assert_eq!(completion.buffer.len(), 16);
    }

    #[test]
    fn test_out_payload() {
        let transfer = BulkTransfer::new(
            TransferId(1),
            0x02,
            b"hello world".to_vec(),
            5,
            Box::new(|_| {}),
        );
        assert_eq!(transfer.direction(), Direction::Out);
        assert_eq!(transfer.data(), b"hello");
        assert!(format!("{:?}", transfer).contains("0x02"));
    }
}
