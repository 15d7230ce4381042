//! USB bulk transfer type definitions
//!
//! Transfer identifiers, endpoint addressing, completion statuses, and the
//! faults that completions latch for the next caller.

use crate::error::DriverError;
use serde::{Deserialize, Serialize};

/// Unique identifier of one submitted transfer
///
/// Assigned by the device from a monotonically increasing counter, so an id is
/// never reused for the lifetime of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Bulk endpoint addresses discovered at attachment
///
/// Either endpoint may be missing; a device without a bulk-in endpoint reads
/// as end-of-file, one without a bulk-out endpoint rejects writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Address of the first bulk-in endpoint (bit 7 set)
    pub bulk_in: Option<u8>,
    /// Address of the first bulk-out endpoint
    pub bulk_out: Option<u8>,
}

impl Endpoints {
    /// Create endpoints with both directions present
    pub fn new(bulk_in: u8, bulk_out: u8) -> Self {
        Self {
            bulk_in: Some(bulk_in),
            bulk_out: Some(bulk_out),
        }
    }

    /// Returns true if neither bulk endpoint was found
    pub fn is_empty(&self) -> bool {
        self.bulk_in.is_none() && self.bulk_out.is_none()
    }
}

/// Final status of a bulk transfer, as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer finished; `actual_length` bytes moved
    Completed,
    /// Transfer was cancelled on request (not a fault)
    Cancelled,
    /// Endpoint halted
    Stall,
    /// Device went away or the connection was shut down
    NoDevice,
    /// Transport-level timeout
    TimedOut,
    /// Device sent more data than requested
    Overflow,
    /// Any other failure
    Error,
}

impl TransferStatus {
    /// Returns true if the transfer moved its data successfully
    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }

    /// Fault to latch for this status, if any
    ///
    /// Success and cancellation latch nothing; unlinking a transfer we asked
    /// to cancel is not an error.
    pub fn fault(self) -> Option<Fault> {
        match self {
            TransferStatus::Completed | TransferStatus::Cancelled => None,
            TransferStatus::Stall => Some(Fault::Stall),
            TransferStatus::NoDevice => Some(Fault::Shutdown),
            TransferStatus::TimedOut | TransferStatus::Overflow | TransferStatus::Error => {
                Some(Fault::Io)
            }
        }
    }
}

/// Transport fault held by the error latch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Fault {
    /// Endpoint stall
    Stall = 1,
    /// Device was reset
    Reset = 2,
    /// Connection shut down
    Shutdown = 3,
    /// Generic I/O fault
    Io = 4,
}

impl Fault {
    /// Compact code for lock-free storage; zero is reserved for "none"
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`Fault::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Fault::Stall),
            2 => Some(Fault::Reset),
            3 => Some(Fault::Shutdown),
            4 => Some(Fault::Io),
            _ => None,
        }
    }
}

impl From<Fault> for DriverError {
    /// Stalls and resets stay distinguishable; everything else collapses to Io
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Stall | Fault::Reset => DriverError::PipeStall,
            Fault::Shutdown | Fault::Io => DriverError::Io,
        }
    }
}

/// Device match table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMatch {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// Accepted USB Product IDs
    pub product_ids: Vec<u16>,
    /// Interface class
    pub class: u8,
    /// Interface subclass
    pub subclass: u8,
    /// Interface protocol
    pub protocol: u8,
}

impl Default for DeviceMatch {
    fn default() -> Self {
        Self {
            vendor_id: crate::VENDOR_ID,
            product_ids: crate::PRODUCT_IDS.to_vec(),
            class: crate::INTERFACE_CLASS,
            subclass: crate::INTERFACE_SUBCLASS,
            protocol: crate::INTERFACE_PROTOCOL,
        }
    }
}

impl DeviceMatch {
    /// Returns true if the device ids are in the table
    pub fn matches_device(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_ids.contains(&product_id)
    }

    /// Returns true if the interface triple matches
    pub fn matches_interface(&self, class: u8, subclass: u8, protocol: u8) -> bool {
        self.class == class && self.subclass == subclass && self.protocol == protocol
    }
}
