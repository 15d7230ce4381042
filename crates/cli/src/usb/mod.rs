//! USB backend for bulkcat
//!
//! - `discovery`: match table lookup, endpoint discovery, interface claiming
//! - `transport`: the driver's [`driver::Transport`] over libusb
//! - `hotplug`: departure detection that triggers a disconnect

pub mod discovery;
pub mod hotplug;
pub mod transport;

pub use discovery::{ClaimedDevice, DeviceSummary, list_devices};
pub use hotplug::HotplugWatcher;
pub use transport::{RusbTransport, TransferTimeouts, UsbPipe};
