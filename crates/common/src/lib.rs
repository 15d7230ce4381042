//! Shared front-end plumbing for usb-bulkdev
//!
//! Logging setup, the front-end error type, and the channel that carries
//! hot-plug events from the libusb event thread into the async runtime.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{BusAddress, DeviceEvent, EventSink, EventStream, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
