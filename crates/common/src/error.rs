//! Common error types

use protocol::DriverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Process exit code for this error, errno-style where one exists
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Driver(e) => e.errno(),
            Error::Io(e) => e.raw_os_error().unwrap_or(1),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_exit_code() {
        let err: Error = DriverError::PipeStall.into();
        assert_eq!(err.exit_code(), 32);
        assert!(err.to_string().contains("stalled"));
    }

    #[test]
    fn test_other_exit_codes() {
        assert_eq!(Error::Config("bad".into()).exit_code(), 1);
        let io = std::io::Error::from_raw_os_error(13);
        assert_eq!(Error::from(io).exit_code(), 13);
    }
}
