//! Attachment errors

use thiserror::Error;

/// Reasons an attachment attempt fails
///
/// These are fatal to the attempt; per-call failures after attachment are
/// [`protocol::DriverError`]s.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    /// The interface exposes neither a bulk-in nor a bulk-out endpoint
    #[error("Interface {interface} has no bulk endpoints")]
    NoEndpoints { interface: u8 },

    /// The reusable inbound buffer could not be allocated
    #[error("Failed to allocate {size}-byte read buffer")]
    BufferAllocation { size: usize },
}

impl From<AttachError> for protocol::DriverError {
    fn from(err: AttachError) -> Self {
        match err {
            AttachError::NoEndpoints { .. } => protocol::DriverError::NotFound,
            AttachError::BufferAllocation { .. } => protocol::DriverError::NoMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DriverError;

    #[test]
    fn test_attach_error_display() {
        let err = AttachError::BufferAllocation { size: 65536 };
        assert!(err.to_string().contains("65536"));

        let err = AttachError::NoEndpoints { interface: 0 };
        assert!(err.to_string().contains("no bulk endpoints"));
    }

    #[test]
    fn test_attach_error_to_driver_error() {
        assert_eq!(
            DriverError::from(AttachError::BufferAllocation { size: 1 }),
            DriverError::NoMemory
        );
        assert_eq!(
            DriverError::from(AttachError::NoEndpoints { interface: 2 }),
            DriverError::NotFound
        );
    }
}
