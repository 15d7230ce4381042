//! libusb-backed transport
//!
//! libusb's synchronous bulk calls run on two worker threads, one per
//! direction, fed through unbounded async channels. The driver bounds the
//! queues itself (one inbound transfer, a fixed number of outbound ones), and
//! each worker is the completion context for the transfers it carries.
//!
//! Inbound transfers wait in slices so a cancellation is noticed within one
//! slice even when the device never answers. rusb drops the byte count of a
//! timed-out transfer, so a slice that expires mid-packet loses what it had
//! received; slicing by the read timeout keeps that to reads the engine has
//! given up on anyway. Outbound transfers are never retried: after a timeout
//! part of the chunk may already be on the wire, so the timeout is reported
//! as a fault instead.

use async_channel::{Receiver, Sender, unbounded};
use driver::{BulkTransfer, SubmitError, Transport};
use protocol::{ControlRequest, Direction, DriverError, TransferId, TransferStatus};
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How long the workers let libusb block on one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTimeouts {
    /// One inbound slice; a cancel waits at most this long to be seen
    pub inbound: Duration,
    /// One outbound transfer, after which it fails with a timeout
    pub outbound: Duration,
}

impl Default for TransferTimeouts {
    fn default() -> Self {
        Self {
            inbound: Duration::from_millis(1000),
            outbound: Duration::from_millis(5000),
        }
    }
}

/// Synchronous USB calls the transport needs
pub trait BulkPipe: Send + Sync + 'static {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize>;

    fn read_control(&self, request: &ControlRequest, buf: &mut [u8]) -> rusb::Result<usize>;

    fn write_control(&self, request: &ControlRequest, buf: &[u8]) -> rusb::Result<usize>;
}

/// An open libusb handle shared between the transport workers and the front end
///
/// Transfers take the lock shared; claiming, releasing, and resetting take it
/// exclusively.
pub struct UsbPipe<C: UsbContext = Context> {
    handle: RwLock<DeviceHandle<C>>,
}

impl<C: UsbContext> UsbPipe<C> {
    pub fn new(handle: DeviceHandle<C>) -> Self {
        Self {
            handle: RwLock::new(handle),
        }
    }

    /// Run `f` with exclusive access to the handle
    pub fn with_handle_mut<R>(&self, f: impl FnOnce(&mut DeviceHandle<C>) -> R) -> R {
        let mut handle = self.handle.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut handle)
    }

    fn shared(&self) -> std::sync::RwLockReadGuard<'_, DeviceHandle<C>> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: UsbContext + 'static> BulkPipe for UsbPipe<C> {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.shared().read_bulk(endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, buf: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.shared().write_bulk(endpoint, buf, timeout)
    }

    fn read_control(&self, request: &ControlRequest, buf: &mut [u8]) -> rusb::Result<usize> {
        self.shared().read_control(
            request.request_type,
            request.request,
            request.value,
            request.index,
            buf,
            request.timeout,
        )
    }

    fn write_control(&self, request: &ControlRequest, buf: &[u8]) -> rusb::Result<usize> {
        self.shared().write_control(
            request.request_type,
            request.request,
            request.value,
            request.index,
            buf,
            request.timeout,
        )
    }
}

/// Map a libusb error onto a transfer status
pub fn map_rusb_error(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}

#[derive(Debug, Default)]
struct Pending {
    active: HashSet<TransferId>,
    cancelled: HashSet<TransferId>,
}

/// Transfers owned by the workers, and which of them were cancelled
#[derive(Debug, Default)]
struct PendingSet(Mutex<Pending>);

impl PendingSet {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, id: TransferId) {
        self.lock().active.insert(id);
    }

    fn cancel(&self, id: TransferId) {
        let mut pending = self.lock();
        if pending.active.contains(&id) {
            pending.cancelled.insert(id);
        }
    }

    fn is_cancelled(&self, id: TransferId) -> bool {
        self.lock().cancelled.contains(&id)
    }

    fn finish(&self, id: TransferId) {
        let mut pending = self.lock();
        pending.active.remove(&id);
        pending.cancelled.remove(&id);
    }
}

/// [`Transport`] over a libusb device handle
pub struct RusbTransport<P: BulkPipe> {
    pipe: Arc<P>,
    inbound: Sender<BulkTransfer>,
    outbound: Sender<BulkTransfer>,
    pending: Arc<PendingSet>,
}

impl<P: BulkPipe> RusbTransport<P> {
    /// Start the worker threads
    pub fn new(pipe: Arc<P>, timeouts: TransferTimeouts) -> io::Result<Self> {
        let pending = Arc::new(PendingSet::default());
        let (inbound, inbound_rx) = unbounded();
        let (outbound, outbound_rx) = unbounded();

        spawn_worker("bulk-in", &pipe, &pending, inbound_rx, timeouts.inbound, run_inbound)?;
        spawn_worker(
            "bulk-out",
            &pipe,
            &pending,
            outbound_rx,
            timeouts.outbound,
            run_outbound,
        )?;

        Ok(Self {
            pipe,
            inbound,
            outbound,
            pending,
        })
    }
}

fn spawn_worker<P: BulkPipe>(
    name: &str,
    pipe: &Arc<P>,
    pending: &Arc<PendingSet>,
    rx: Receiver<BulkTransfer>,
    timeout: Duration,
    run: fn(&P, &PendingSet, Receiver<BulkTransfer>, Duration),
) -> io::Result<()> {
    let pipe = Arc::clone(pipe);
    let pending = Arc::clone(pending);
    // Detached: the last device reference may drop on this very thread
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!("Worker started");
            run(&pipe, &pending, rx, timeout);
            debug!("Worker stopped");
        })?;
    Ok(())
}

fn run_inbound<P: BulkPipe>(
    pipe: &P,
    pending: &PendingSet,
    rx: Receiver<BulkTransfer>,
    slice: Duration,
) {
    while let Ok(mut transfer) = rx.recv_blocking() {
        let id = transfer.id();
        let endpoint = transfer.endpoint();

        let (status, actual) = loop {
            if pending.is_cancelled(id) || rx.is_closed() {
                break (TransferStatus::Cancelled, 0);
            }
            match pipe.read_bulk(endpoint, transfer.data_mut(), slice) {
                Ok(n) => break (TransferStatus::Completed, n),
                Err(rusb::Error::Timeout) => continue,
                Err(e) => break (map_rusb_error(e), 0),
            }
        };

        trace!("Inbound transfer {:?}: {:?}, {} bytes", id, status, actual);
        pending.finish(id);
        transfer.complete(status, actual);
    }
}

fn run_outbound<P: BulkPipe>(
    pipe: &P,
    pending: &PendingSet,
    rx: Receiver<BulkTransfer>,
    timeout: Duration,
) {
    while let Ok(transfer) = rx.recv_blocking() {
        let id = transfer.id();

        let (status, actual) = if pending.is_cancelled(id) {
            (TransferStatus::Cancelled, 0)
        } else {
            match pipe.write_bulk(transfer.endpoint(), transfer.data(), timeout) {
                Ok(n) => (TransferStatus::Completed, n),
                Err(e) => {
                    // Part of the chunk may have gone out; resending could duplicate it
                    debug!("Outbound transfer {:?} failed: {}", id, e);
                    (map_rusb_error(e), 0)
                }
            }
        };

        trace!("Outbound transfer {:?}: {:?}, {} bytes", id, status, actual);
        pending.finish(id);
        transfer.complete(status, actual);
    }
}

impl<P: BulkPipe> Transport for RusbTransport<P> {
    fn submit(&self, transfer: BulkTransfer) -> Result<(), SubmitError> {
        let queue = match transfer.direction() {
            Direction::In => &self.inbound,
            Direction::Out => &self.outbound,
        };

        let id = transfer.id();
        self.pending.start(id);
        queue.try_send(transfer).map_err(|e| {
            warn!("Transfer queue closed");
            self.pending.finish(id);
            SubmitError::new(DriverError::NotFound, e.into_inner())
        })
    }

    fn cancel(&self, id: TransferId) {
        self.pending.cancel(id);
    }

    fn control_in(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
    ) -> Result<usize, TransferStatus> {
        self.pipe
            .read_control(&request, buf)
            .map_err(map_rusb_error)
    }

    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize, TransferStatus> {
        self.pipe
            .write_control(&request, data)
            .map_err(map_rusb_error)
    }
}

impl<P: BulkPipe> Drop for RusbTransport<P> {
    fn drop(&mut self) {
        // Workers finish whatever is queued, then exit on their own
        self.inbound.close();
        self.outbound.close();
        debug!("Transport closed");
    }
}
