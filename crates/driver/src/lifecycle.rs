//! Open/close, power management, reset, and teardown
//!
//! ```text
//! Attached -> Open -> Disconnecting -> Destroyed
//!     ^        |
//!     +--------+  (close)
//! ```
//!
//! Suspended and reset-in-progress overlay Attached and Open.

use crate::device::{BulkDevice, Shared};
use crate::interrupt::{InterruptFlag, Interrupter};
use crate::transport::Transport;
use protocol::{DriverError, Fault, READ_MAX_LENGTH, Result};
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

impl<T: Transport> BulkDevice<T> {
    /// Open the device for I/O
    ///
    /// Only one handle may be open at a time.
    pub fn open(&self) -> Result<OpenHandle<T>> {
        let shared = &self.shared;
        if shared.is_disconnecting() {
            return Err(DriverError::NotFound);
        }

        let io = shared.io.lock();
        if !shared.is_bound() {
            return Err(DriverError::NotFound);
        }
        if shared
            .open_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Rejecting second open");
            return Err(DriverError::Busy);
        }
        if let Err(e) = shared.transport.power_get() {
            warn!("Failed to wake device: {}", e);
            shared.open_count.store(0, Ordering::Release);
            return Err(e);
        }
        drop(io);

        debug!("Device opened");
        Ok(OpenHandle::new(Arc::clone(shared)))
    }

    /// Tear down the attachment
    ///
    /// Cancels every outstanding transfer and waits for the callbacks. Open
    /// handles keep the state alive but see [`DriverError::NotFound`] from
    /// then on.
    pub fn disconnect(self) {
        self.shared.teardown();
    }

    /// Quiesce I/O before the device sleeps
    pub fn suspend(&self) {
        self.shared.drain();
        self.shared.suspended.store(true, Ordering::Release);
        debug!("Device suspended");
    }

    pub fn resume(&self) {
        self.shared.suspended.store(false, Ordering::Release);
        debug!("Device resumed");
    }

    /// Quiesce I/O and block submissions until [`BulkDevice::post_reset`]
    pub fn pre_reset(&self) {
        let io = self.shared.io.lock();
        self.shared.drain();
        io.hold();
        debug!("Device reset starting");
    }

    /// Finish a reset begun by [`BulkDevice::pre_reset`]
    ///
    /// The next caller to touch the device learns about the reset through a
    /// one-shot [`DriverError::PipeStall`].
    pub fn post_reset(&self) {
        self.shared.errors.set(Fault::Reset);
        self.shared.io.release_held();
        debug!("Device reset finished");
    }
}

impl<T: Transport> Shared<T> {
    /// Let outstanding writes finish (bounded), then cancel what is left
    /// along with the pending read
    pub(crate) fn drain(&self) {
        if !self.writer.wait_idle(self.config.drain_timeout) {
            let killed = self.writer.kill_all(|id| self.transport.cancel(id));
            debug!("Drain cancelled {} outbound transfers", killed);
        }
        self.kill_read();
    }

    pub(crate) fn flush(&self) -> Result<()> {
        let _io = self.io.lock();
        self.drain();
        match self.errors.take() {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    pub(crate) fn teardown(&self) {
        if self.disconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let io = self.io.lock();
            self.unbind_interface(&io);
        }

        let killed = self.writer.kill_all(|id| self.transport.cancel(id));
        self.kill_read();
        self.wake_waiters();

        info!("Bulk device disconnected ({} writes cancelled)", killed);
    }

    fn release_open(&self) {
        let _io = self.io.lock();
        if self.open_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            if self.is_bound() {
                self.transport.power_put();
            }
            self.reader.clear_markers();
        }
        debug!("Device closed");
    }
}

/// An open device
///
/// `read`, `write`, and `flush` take `&self`, so one handle may be shared
/// between threads. Dropping the handle closes it.
pub struct OpenHandle<T: Transport> {
    device: Arc<Shared<T>>,
    interrupt: InterruptFlag,
    nonblocking: bool,
}

impl<T: Transport> OpenHandle<T> {
    fn new(device: Arc<Shared<T>>) -> Self {
        Self {
            device,
            interrupt: InterruptFlag::default(),
            nonblocking: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.device
    }

    /// Block until one inbound transfer delivers data, then copy it into `buf`
    ///
    /// Returns 0 when nothing arrived within the read timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.device.read(buf, &self.interrupt)
    }

    /// Queue up to one chunk of `data` and return how much was accepted
    ///
    /// Blocks while every in-flight slot is taken unless `nonblocking` is
    /// set, in which case it fails with [`DriverError::TryAgain`].
    pub fn write(&self, data: &[u8], nonblocking: bool) -> Result<usize> {
        self.device.write(data, nonblocking, &self.interrupt)
    }

    /// Wait out (or cancel) outstanding I/O and report any latched fault
    pub fn flush(&self) -> Result<()> {
        self.device.flush()
    }

    /// Mode used by the `std::io::Write` implementation
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// A handle another thread can use to break this one out of a blocking call
    pub fn interrupter(&self) -> Interrupter<T> {
        Interrupter::new(self.interrupt.clone(), &self.device)
    }

    pub fn close(self) {
        drop(self);
    }
}

impl<T: Transport> Drop for OpenHandle<T> {
    fn drop(&mut self) {
        self.interrupt.clear();
        self.device.release_open();
    }
}

impl<T: Transport> io::Read for OpenHandle<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(READ_MAX_LENGTH);
        OpenHandle::read(self, &mut buf[..len]).map_err(io::Error::from)
    }
}

impl<T: Transport> io::Write for OpenHandle<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let nonblocking = self.nonblocking;
        OpenHandle::write(self, buf, nonblocking).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        OpenHandle::flush(self).map_err(io::Error::from)
    }
}
