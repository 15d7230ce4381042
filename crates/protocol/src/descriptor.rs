//! Control-channel requests and string descriptors

use crate::error::{DriverError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::time::Duration;

/// Standard request: GET_DESCRIPTOR
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
/// Standard request: CLEAR_FEATURE
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
/// Descriptor type: STRING
pub const DT_STRING: u8 = 0x03;
/// bmRequestType for a standard device-to-host request
pub const DIR_IN: u8 = 0x80;
/// bmRequestType for a standard host-to-device request
pub const TYPE_STANDARD: u8 = 0x00;
/// US English language id
pub const LANGID_EN_US: u16 = 0x0409;
/// Largest string descriptor we request
pub const STRING_DESCRIPTOR_MAX: usize = 255;
/// wIndex of the feature-clear request
pub const CLEAR_FEATURE_INDEX: u16 = 0x82;
/// Scratch buffer sent with the feature-clear request
pub const CLEAR_FEATURE_SCRATCH: usize = 8;
/// Timeout for control requests
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Setup packet of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// How long the transport may take
    pub timeout: Duration,
}

impl ControlRequest {
    /// GET_DESCRIPTOR(STRING, index) in US English
    pub fn get_string(index: u8) -> Self {
        Self {
            request_type: DIR_IN,
            request: REQ_GET_DESCRIPTOR,
            value: ((DT_STRING as u16) << 8) + index as u16,
            index: LANGID_EN_US,
            timeout: CONTROL_TIMEOUT,
        }
    }

    /// The vendor's feature-clear request
    pub fn clear_feature() -> Self {
        Self {
            request_type: TYPE_STANDARD,
            request: REQ_CLEAR_FEATURE,
            value: 0,
            index: CLEAR_FEATURE_INDEX,
            timeout: CONTROL_TIMEOUT,
        }
    }

    /// Returns true if data flows device to host
    pub fn is_in(&self) -> bool {
        self.request_type & DIR_IN != 0
    }
}

/// A string descriptor as returned by the device
///
/// `raw` is length-prefixed: `raw[0]` is bLength, `raw[1]` is bDescriptorType,
/// and the UTF-16LE payload follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringDescriptor {
    /// Descriptor index that was queried
    pub index: u8,
    raw: Vec<u8>,
}

impl StringDescriptor {
    /// Validate a reply of `len` bytes received into `buf`
    pub fn parse(index: u8, buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(DriverError::NoData);
        }
        if buf.len() > 1 && buf[1] != DT_STRING {
            return Err(DriverError::NoData);
        }

        // bLength may claim more than actually arrived
        let len = (buf[0] as usize).min(buf.len());
        Ok(Self {
            index,
            raw: buf[..len].to_vec(),
        })
    }

    /// bLength as reported by the device
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns true if the descriptor carries no bytes
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Raw length-prefixed descriptor bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Copy the raw descriptor into a caller buffer
    pub fn copy_to(&self, out: &mut [u8]) -> Result<usize> {
        let dst = out.get_mut(..self.raw.len()).ok_or(DriverError::Fault)?;
        dst.copy_from_slice(&self.raw);
        Ok(self.raw.len())
    }

    /// Decode the UTF-16LE payload, replacing invalid code units
    pub fn to_string_lossy(&self) -> String {
        let payload = self.raw.get(2..).unwrap_or_default();
        let units: Vec<u16> = payload.chunks_exact(2).map(LittleEndian::read_u16).collect();
        String::from_utf16_lossy(&units)
    }
}
