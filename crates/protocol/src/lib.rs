//! USB-level types for usb-bulkdev
//!
//! This crate defines the vocabulary shared by the bulk driver engine and its
//! transports: transfer identifiers and statuses, the faults a completion can
//! latch, endpoint addressing, the device match table, and the two control
//! requests the device understands.
//!
//! # Example
//!
//! ```
//! use protocol::{DriverError, Fault, TransferStatus};
//!
//! let fault = TransferStatus::Stall.fault().unwrap();
//! assert_eq!(fault, Fault::Stall);
//! assert_eq!(DriverError::from(fault), DriverError::PipeStall);
//! ```

pub mod descriptor;
pub mod error;
pub mod types;

pub use descriptor::{ControlRequest, StringDescriptor};
pub use error::{DriverError, Result};
pub use types::{DeviceMatch, Direction, Endpoints, Fault, TransferId, TransferStatus};

/// Vendor id of supported devices
pub const VENDOR_ID: u16 = 0x1ef1;
/// Product ids of supported devices
pub const PRODUCT_IDS: [u16; 2] = [0x0001, 0x0011];
/// Vendor-specific interface class
pub const INTERFACE_CLASS: u8 = 0xff;
/// Interface subclass
pub const INTERFACE_SUBCLASS: u8 = 0x00;
/// Interface protocol
pub const INTERFACE_PROTOCOL: u8 = 0x00;

/// Capacity of the inbound buffer, also the largest accepted read
pub const READ_MAX_LENGTH: usize = 64 * 1024;
/// Largest chunk accepted by one write (one page less the largest EHCI packet)
pub const MAX_TRANSFER: usize = 4096 - 512;
/// Outbound transfers allowed in flight at once
pub const WRITES_IN_FLIGHT: usize = 8;
/// How long a read waits for its completion
pub const READ_TIMEOUT_MS: u64 = 1000;
/// How long a drain waits for writes before cancelling them
pub const DRAIN_TIMEOUT_MS: u64 = 1000;
