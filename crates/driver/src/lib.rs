//! Byte-stream engine for a vendor-specific USB bulk device
//!
//! The engine turns a pair of bulk endpoints into blocking `read`/`write`
//! calls. Reads reuse one 64 KiB buffer with at most one inbound transfer
//! outstanding and a bounded wait; writes are queued asynchronously with at
//! most eight outbound transfers in flight. Transport faults seen by a
//! completion are latched and reported once, to the next caller.
//!
//! The host controller sits behind the [`Transport`] trait. Lifecycle events
//! (suspend, resume, reset, disconnect) are delivered through [`BulkDevice`];
//! I/O goes through the [`OpenHandle`] it hands out.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::attach_mock;
//!
//! let (device, transport) = attach_mock();
//! let handle = device.open().unwrap();
//!
//! assert_eq!(handle.write(b"hello", false).unwrap(), 5);
//! drop(handle);
//! device.disconnect();
//! assert_eq!(transport.written(), b"hello");
//! ```

mod access;
mod anchor;
mod control;
mod device;
mod error;
mod interrupt;
mod lifecycle;
mod limiter;
mod read;
mod write;

pub mod config;
pub mod error_latch;
pub mod transport;

/// Mock transport, available to this crate's tests and behind the
/// `test-utils` feature; not part of the stable API.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::DriverConfig;
pub use control::STRING_ATTEMPTS;
pub use device::{BulkDevice, InterfaceBinding};
pub use error::AttachError;
pub use error_latch::ErrorLatch;
pub use interrupt::Interrupter;
pub use lifecycle::OpenHandle;
pub use transport::{BulkTransfer, Completion, CompletionFn, SubmitError, Transport};
