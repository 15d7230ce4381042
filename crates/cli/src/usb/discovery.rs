//! Device discovery and interface claiming
//!
//! Walks the bus for devices in the match table, picks the vendor-class
//! interface, and finds its first bulk-in and bulk-out endpoints.

use crate::usb::transport::UsbPipe;
use anyhow::{Context as _, Result, anyhow};
use common::BusAddress;
use driver::InterfaceBinding;
use protocol::{DeviceMatch, Endpoints};
use rusb::{ConfigDescriptor, Context, Device, TransferType, UsbContext};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A matching device seen on the bus
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub at: BusAddress,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    /// Matching interface and its bulk endpoints, if any
    pub binding: Option<InterfaceBinding>,
}

/// Bus position of a device
pub fn bus_address<T: UsbContext>(device: &Device<T>) -> BusAddress {
    BusAddress {
        bus: device.bus_number(),
        address: device.address(),
    }
}

/// First bulk-in and first bulk-out endpoint among `(address, type)` pairs
pub fn first_bulk_endpoints(endpoints: impl IntoIterator<Item = (u8, TransferType)>) -> Endpoints {
    let mut found = Endpoints::default();
    for (address, transfer_type) in endpoints {
        if transfer_type != TransferType::Bulk {
            continue;
        }
        let slot = if address & 0x80 != 0 {
            &mut found.bulk_in
        } else {
            &mut found.bulk_out
        };
        if slot.is_none() {
            *slot = Some(address);
        }
    }
    found
}

/// Locate the interface to bind in the active configuration
///
/// Only the default alternate setting is considered; it is the one in
/// effect right after the interface is claimed.
fn find_interface(
    config: &ConfigDescriptor,
    matcher: &DeviceMatch,
    wanted: Option<u8>,
) -> Option<InterfaceBinding> {
    for interface in config.interfaces() {
        let Some(setting) = interface.descriptors().next() else {
            continue;
        };
        if wanted.is_some_and(|n| n != setting.interface_number()) {
            continue;
        }
        if !matcher.matches_interface(
            setting.class_code(),
            setting.sub_class_code(),
            setting.protocol_code(),
        ) {
            continue;
        }

        let endpoints = first_bulk_endpoints(
            setting
                .endpoint_descriptors()
                .map(|ep| (ep.address(), ep.transfer_type())),
        );
        return Some(InterfaceBinding {
            number: setting.interface_number(),
            endpoints,
        });
    }
    None
}

/// List every matching device
pub fn list_devices(
    context: &Context,
    matcher: &DeviceMatch,
    wanted: Option<u8>,
) -> Result<Vec<DeviceSummary>> {
    let devices = context.devices().context("Failed to enumerate USB devices")?;

    let mut found = Vec::new();
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if !matcher.matches_device(descriptor.vendor_id(), descriptor.product_id()) {
            continue;
        }

        let binding = device
            .active_config_descriptor()
            .ok()
            .and_then(|config| find_interface(&config, matcher, wanted));

        // Strings need an open handle; permissions may not allow one
        let (manufacturer, product, serial_number) = match device.open() {
            Ok(handle) => (
                descriptor
                    .manufacturer_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
                descriptor
                    .product_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
                descriptor
                    .serial_number_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
            ),
            Err(e) => {
                debug!("Cannot open {:?} to read strings: {}", bus_address(&device), e);
                (None, None, None)
            }
        };

        found.push(DeviceSummary {
            at: bus_address(&device),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            manufacturer,
            product,
            serial_number,
            binding,
        });
    }

    debug!("Found {} matching devices", found.len());
    Ok(found)
}

/// A device whose interface we hold
///
/// Dropping it releases the interface and hands it back to the kernel driver
/// we detached, if any.
pub struct ClaimedDevice {
    pipe: Arc<UsbPipe>,
    at: BusAddress,
    binding: InterfaceBinding,
    kernel_detached: bool,
}

impl ClaimedDevice {
    /// Open the first matching device (optionally at a given bus position)
    /// and claim its interface
    pub fn open(
        context: &Context,
        matcher: &DeviceMatch,
        wanted: Option<u8>,
        at: Option<BusAddress>,
    ) -> Result<Self> {
        let devices = context.devices().context("Failed to enumerate USB devices")?;

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if !matcher.matches_device(descriptor.vendor_id(), descriptor.product_id()) {
                continue;
            }
            if at.is_some_and(|at| at != bus_address(&device)) {
                continue;
            }

            let config = device
                .active_config_descriptor()
                .context("Failed to get active config descriptor")?;
            let Some(binding) = find_interface(&config, matcher, wanted) else {
                debug!("{:?} has no matching interface", bus_address(&device));
                continue;
            };

            return Self::claim(&device, binding);
        }

        Err(anyhow!(
            "No device {:04x}:{{{}}} found",
            matcher.vendor_id,
            matcher
                .product_ids
                .iter()
                .map(|pid| format!("{:04x}", pid))
                .collect::<Vec<_>>()
                .join(",")
        ))
    }

    fn claim(device: &Device<Context>, binding: InterfaceBinding) -> Result<Self> {
        let at = bus_address(device);
        let mut handle = device
            .open()
            .with_context(|| format!("Failed to open device at {:03}:{:03}", at.bus, at.address))?;

        let number = binding.number;
        let kernel_detached = match handle.kernel_driver_active(number) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", number);
                handle
                    .detach_kernel_driver(number)
                    .with_context(|| format!("Failed to detach kernel driver from interface {}", number))?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!("Could not check kernel driver status for interface {}: {}", number, e);
                false
            }
        };

        if let Err(e) = handle.claim_interface(number) {
            if kernel_detached {
                let _ = handle.attach_kernel_driver(number);
            }
            return Err(e).with_context(|| format!("Failed to claim interface {}", number));
        }

        info!(
            "Claimed interface {} on {:03}:{:03} (in={:?}, out={:?})",
            number, at.bus, at.address, binding.endpoints.bulk_in, binding.endpoints.bulk_out
        );

        Ok(Self {
            pipe: Arc::new(UsbPipe::new(handle)),
            at,
            binding,
            kernel_detached,
        })
    }

    pub fn pipe(&self) -> &Arc<UsbPipe> {
        &self.pipe
    }

    pub fn at(&self) -> BusAddress {
        self.at
    }

    pub fn binding(&self) -> InterfaceBinding {
        self.binding
    }

    /// Port-reset the device
    ///
    /// libusb re-claims the interface afterwards when the device comes back
    /// with the same descriptors.
    pub fn reset(&self) -> rusb::Result<()> {
        self.pipe.with_handle_mut(|handle| handle.reset())
    }
}

impl Drop for ClaimedDevice {
    fn drop(&mut self) {
        let number = self.binding.number;
        let kernel_detached = self.kernel_detached;
        self.pipe.with_handle_mut(|handle| {
            if let Err(e) = handle.release_interface(number) {
                debug!("Failed to release interface {}: {}", number, e);
            }
            if kernel_detached {
                if let Err(e) = handle.attach_kernel_driver(number) {
                    warn!("Could not reattach kernel driver to interface {}: {}", number, e);
                }
            }
        });
        debug!("Released interface {}", number);
    }
}
