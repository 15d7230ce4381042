//! Driver error types

use thiserror::Error;

/// Errors surfaced to callers of the bulk device
///
/// Transport faults (`PipeStall`, `Io`) are latched when a completion observes
/// them and handed to the next caller. Everything else is a local fault
/// returned directly from the failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DriverError {
    /// Device is gone (disconnected or never bound)
    #[error("Device not found")]
    NotFound,

    /// Device is already opened by another caller
    #[error("Device busy")]
    Busy,

    /// A blocking wait was interrupted by the caller
    #[error("Interrupted")]
    Interrupted,

    /// Endpoint stalled, or the device was reset underneath us
    #[error("Endpoint stalled")]
    PipeStall,

    /// Any other transport fault
    #[error("I/O error")]
    Io,

    /// Nonblocking write with every in-flight slot taken
    #[error("Resource temporarily unavailable, try again")]
    TryAgain,

    /// Buffer allocation failed
    #[error("Out of memory")]
    NoMemory,

    /// Data could not be copied across the caller boundary
    #[error("Bad address")]
    Fault,

    /// Control request issued while the device is suspended
    #[error("Host unreachable (device suspended)")]
    HostUnreachable,

    /// Device returned a malformed descriptor
    #[error("No data available")]
    NoData,
}

impl DriverError {
    /// POSIX errno equivalent, for glue that speaks file-descriptor semantics
    pub fn errno(self) -> i32 {
        match self {
            DriverError::NotFound => 19,         // ENODEV
            DriverError::Busy => 16,             // EBUSY
            DriverError::Interrupted => 4,       // EINTR
            DriverError::PipeStall => 32,        // EPIPE
            DriverError::Io => 5,                // EIO
            DriverError::TryAgain => 11,         // EAGAIN
            DriverError::NoMemory => 12,         // ENOMEM
            DriverError::Fault => 14,            // EFAULT
            DriverError::HostUnreachable => 113, // EHOSTUNREACH
            DriverError::NoData => 61,           // ENODATA
        }
    }

    /// Returns true for faults that originate on the bus rather than locally
    pub fn is_transport_fault(self) -> bool {
        matches!(self, DriverError::PipeStall | DriverError::Io)
    }
}

impl From<DriverError> for std::io::Error {
    fn from(err: DriverError) -> Self {
        use std::io::ErrorKind;

        let kind = match err {
            DriverError::NotFound => ErrorKind::NotFound,
            DriverError::Busy => ErrorKind::ResourceBusy,
            DriverError::Interrupted => ErrorKind::Interrupted,
            DriverError::PipeStall => ErrorKind::BrokenPipe,
            DriverError::TryAgain => ErrorKind::WouldBlock,
            DriverError::NoMemory => ErrorKind::OutOfMemory,
            DriverError::Fault => ErrorKind::InvalidInput,
            DriverError::HostUnreachable => ErrorKind::HostUnreachable,
            DriverError::NoData => ErrorKind::InvalidData,
            DriverError::Io => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;
