//! Control-endpoint helpers
//!
//! Both requests are synchronous and bypass the bulk engines, but they still
//! respect the interface binding and refuse to wake a suspended device.

use crate::access::AccessGuard;
use crate::device::Shared;
use crate::lifecycle::OpenHandle;
use crate::transport::Transport;
use protocol::descriptor::{CLEAR_FEATURE_SCRATCH, STRING_DESCRIPTOR_MAX};
use protocol::{ControlRequest, DriverError, Result, StringDescriptor, TransferStatus};
use std::sync::atomic::Ordering;
use tracing::debug;

/// Attempts made for one string descriptor
pub const STRING_ATTEMPTS: usize = 3;

fn status_error(status: TransferStatus) -> DriverError {
    status.fault().map_or(DriverError::Io, DriverError::from)
}

impl<T: Transport> Shared<T> {
    fn control_access(&self) -> Result<AccessGuard<'_>> {
        if self.suspended.load(Ordering::Acquire) {
            return Err(DriverError::HostUnreachable);
        }
        let io = self.io.lock();
        if !self.is_bound() {
            return Err(DriverError::NotFound);
        }
        Ok(io)
    }

    pub(crate) fn string_descriptor(&self, index: u8) -> Result<StringDescriptor> {
        let _io = self.control_access()?;

        let mut buf = [0u8; STRING_DESCRIPTOR_MAX];
        let mut last = DriverError::NoData;
        for attempt in 1..=STRING_ATTEMPTS {
            let request = ControlRequest::get_string(index);
            match self.transport.control_in(request, &mut buf) {
                Ok(0) => last = DriverError::NoData,
                Ok(len) => match StringDescriptor::parse(index, &buf[..len]) {
                    Ok(descriptor) => return Ok(descriptor),
                    Err(e) => last = e,
                },
                Err(TransferStatus::Stall) => last = DriverError::PipeStall,
                Err(status) => return Err(status_error(status)),
            }
            debug!(
                "String descriptor {} attempt {}/{} failed: {}",
                index, attempt, STRING_ATTEMPTS, last
            );
        }
        Err(last)
    }

    pub(crate) fn clear_feature(&self) -> Result<()> {
        let _io = self.control_access()?;

        let scratch = [0u8; CLEAR_FEATURE_SCRATCH];
        self.transport
            .control_out(ControlRequest::clear_feature(), &scratch)
            .map(|_| ())
            .map_err(status_error)
    }
}

impl<T: Transport> OpenHandle<T> {
    /// Fetch string descriptor `index` in US English
    ///
    /// Empty and stalled replies are retried up to [`STRING_ATTEMPTS`] times.
    pub fn string_descriptor(&self, index: u8) -> Result<StringDescriptor> {
        self.shared().string_descriptor(index)
    }

    /// Issue the device's CLEAR_FEATURE request
    pub fn clear_feature(&self) -> Result<()> {
        self.shared().clear_feature()
    }
}
