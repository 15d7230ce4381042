//! Reference-counted device state
//!
//! [`Shared`] is the state every party holds a reference to: the attachment
//! ([`BulkDevice`]), each open handle, and each transfer in flight (through
//! its completion callback). Whichever holder lets go last destroys it, which
//! frees the inbound buffer and the transport connection.

use crate::access::{AccessGuard, AccessLock, lock};
use crate::config::DriverConfig;
use crate::error::AttachError;
use crate::error_latch::ErrorLatch;
use crate::read::ReadEngine;
use crate::transport::Transport;
use crate::write::WriteEngine;
use protocol::{Endpoints, Fault, TransferId};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// The live association between the device and its USB interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceBinding {
    /// bInterfaceNumber
    pub number: u8,
    /// Bulk endpoints found on the interface
    pub endpoints: Endpoints,
}

/// State shared by every holder of the device
pub(crate) struct Shared<T: Transport> {
    pub(crate) transport: T,
    /// Cleared on teardown; only touched with `io` held
    interface: Mutex<Option<InterfaceBinding>>,
    pub(crate) endpoints: Endpoints,
    pub(crate) io: AccessLock,
    pub(crate) open_count: AtomicUsize,
    pub(crate) disconnecting: AtomicBool,
    pub(crate) suspended: AtomicBool,
    pub(crate) errors: ErrorLatch,
    pub(crate) reader: ReadEngine,
    pub(crate) writer: WriteEngine,
    pub(crate) config: DriverConfig,
    next_id: AtomicU64,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn next_transfer_id(&self) -> TransferId {
        TransferId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn is_bound(&self) -> bool {
        lock(&self.interface).is_some()
    }

    pub(crate) fn bind_interface(&self, binding: InterfaceBinding, _io: &AccessGuard<'_>) {
        *lock(&self.interface) = Some(binding);
    }

    pub(crate) fn unbind_interface(&self, _io: &AccessGuard<'_>) -> Option<InterfaceBinding> {
        lock(&self.interface).take()
    }

    pub(crate) fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Acquire)
    }

    /// Kick every interruptible sleeper so it rechecks its interrupt flag
    pub(crate) fn wake_waiters(&self) {
        self.reader.wake();
        self.io.wake();
        self.writer.wake();
    }
}

impl<T: Transport> Drop for Shared<T> {
    fn drop(&mut self) {
        debug!(
            "Releasing device state ({} transfers issued)",
            self.next_id.load(Ordering::Relaxed)
        );
    }
}

/// An attached bulk device
///
/// Owns the attachment's reference to the shared state. Lifecycle hooks
/// (suspend, resume, reset, disconnect) are invoked through this type; I/O
/// goes through the [`OpenHandle`](crate::OpenHandle) returned by `open`.
/// Dropping the device disconnects it.
pub struct BulkDevice<T: Transport> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T: Transport> BulkDevice<T> {
    /// Attach to an interface
    ///
    /// Allocates the inbound buffer up front; failing to do so is fatal to the
    /// attachment.
    pub fn attach(
        transport: T,
        binding: InterfaceBinding,
        config: DriverConfig,
    ) -> Result<Self, AttachError> {
        let config = config.sanitized();
        let endpoints = binding.endpoints;

        if endpoints.is_empty() {
            return Err(AttachError::NoEndpoints {
                interface: binding.number,
            });
        }

        let read_buffer = match endpoints.bulk_in {
            Some(_) => {
                let size = config.read_buffer_size;
                let mut buffer = Vec::new();
                buffer
                    .try_reserve_exact(size)
                    .map_err(|_| AttachError::BufferAllocation { size })?;
                buffer.resize(size, 0);
                Some(buffer)
            }
            None => None,
        };

        let shared = Arc::new(Shared {
            transport,
            interface: Mutex::new(None),
            endpoints,
            io: AccessLock::new("io"),
            open_count: AtomicUsize::new(0),
            disconnecting: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            errors: ErrorLatch::new(),
            reader: ReadEngine::new(read_buffer),
            writer: WriteEngine::new(config.writes_in_flight, config.max_transfer),
            config,
            next_id: AtomicU64::new(1),
        });

        {
            let io = shared.io.lock();
            shared.bind_interface(binding, &io);
        }

        info!(
            "Attached bulk device on interface {} (in={:?}, out={:?})",
            binding.number, endpoints.bulk_in, endpoints.bulk_out
        );

        Ok(Self { shared })
    }

    /// Bulk endpoints in use
    pub fn endpoints(&self) -> Endpoints {
        self.shared.endpoints
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    /// The transport connection
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// Number of holders of the shared state (attachment, open handles,
    /// completions in flight)
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub fn is_bound(&self) -> bool {
        self.shared.is_bound()
    }

    pub fn is_disconnecting(&self) -> bool {
        self.shared.is_disconnecting()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> usize {
        self.shared.open_count.load(Ordering::Acquire)
    }

    /// Outbound transfers submitted and not yet completed
    pub fn outstanding_writes(&self) -> usize {
        self.shared.writer.outstanding()
    }

    /// Returns true while an inbound transfer is in the transport's hands
    pub fn read_in_flight(&self) -> bool {
        self.shared.reader.in_flight().is_some()
    }

    /// Latched fault waiting for the next caller, without consuming it
    pub fn pending_fault(&self) -> Option<Fault> {
        self.shared.errors.peek()
    }
}

impl<T: Transport> Drop for BulkDevice<T> {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}
