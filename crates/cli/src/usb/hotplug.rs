//! Hot-plug monitoring
//!
//! Registers a libusb hot-plug callback for the vendor and pumps libusb
//! events on a dedicated thread. Arrivals and departures are forwarded to the
//! async side through the event bridge.

use crate::usb::discovery::bus_address;
use anyhow::{Context as _, Result, anyhow};
use common::{DeviceEvent, EventSink};
use protocol::DeviceMatch;
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block
const EVENT_POLL: Duration = Duration::from_millis(100);

struct HotplugCallback {
    matcher: DeviceMatch,
    sink: EventSink,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        let Ok(descriptor) = device.device_descriptor() else {
            return;
        };
        if !self
            .matcher
            .matches_device(descriptor.vendor_id(), descriptor.product_id())
        {
            return;
        }

        let at = bus_address(&device);
        debug!("Hot-plug: device arrived (bus={}, addr={})", at.bus, at.address);
        if let Err(e) = self.sink.publish(DeviceEvent::Arrived {
            at,
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
        }) {
            debug!("Dropping arrival event: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        // Descriptors are gone by now; the bus position is all we get
        let at = bus_address(&device);
        debug!("Hot-plug: device left (bus={}, addr={})", at.bus, at.address);
        if let Err(e) = self.sink.publish(DeviceEvent::Left { at }) {
            debug!("Dropping departure event: {}", e);
        }
    }
}

/// Live hot-plug registration plus its event thread
///
/// Dropping the watcher deregisters the callback and stops the thread.
pub struct HotplugWatcher {
    registration: Option<Registration<Context>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWatcher {
    /// Start watching for devices of `matcher`'s vendor
    pub fn start(context: &Context, matcher: DeviceMatch, sink: EventSink) -> Result<Self> {
        if !rusb::has_hotplug() {
            return Err(anyhow!("libusb was built without hot-plug support"));
        }

        let vendor_id = matcher.vendor_id;
        let callback = HotplugCallback { matcher, sink };
        let registration = HotplugBuilder::new()
            .vendor_id(vendor_id)
            .enumerate(false)
            .register(context, Box::new(callback))
            .context("Failed to register hot-plug callback")?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let context = context.clone();
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("usb-events".to_string())
                .spawn(move || pump_events(&context, &stop))
                .context("Failed to spawn USB event thread")?
        };

        info!("Watching for hot-plug events (vendor {:04x})", vendor_id);
        Ok(Self {
            registration: Some(registration),
            stop,
            thread: Some(thread),
        })
    }
}

fn pump_events(context: &Context, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        match context.handle_events(Some(EVENT_POLL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                error!("USB event handling failed: {}", e);
                thread::sleep(EVENT_POLL);
            }
        }
    }
    debug!("USB event thread stopped");
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        // Deregister while the event thread is still pumping
        drop(self.registration.take());
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("USB event thread panicked");
            }
        }
    }
}
