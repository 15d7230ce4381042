//! Async channel bridge between the libusb event thread and Tokio
//!
//! Hot-plug callbacks run on the thread pumping libusb events and must not
//! block; they push into a bounded channel that the async side drains.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::warn;

/// Bus position of a USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress {
    pub bus: u8,
    pub address: u8,
}

/// Hot-plug notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A matching device was plugged in
    Arrived {
        at: BusAddress,
        vendor_id: u16,
        product_id: u16,
    },

    /// A device went away
    Left { at: BusAddress },
}

/// Sending half, owned by the hot-plug callback
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<DeviceEvent>,
}

impl EventSink {
    /// Queue an event without blocking; drops it if the queue is full
    pub fn publish(&self, event: DeviceEvent) -> crate::Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {:?}", event);
                Ok(())
            }
            Err(e @ TrySendError::Closed(_)) => Err(crate::Error::Channel(e.to_string())),
        }
    }
}

/// Receiving half, polled from the async runtime
#[derive(Debug, Clone)]
pub struct EventStream {
    rx: Receiver<DeviceEvent>,
}

impl EventStream {
    /// Wait for the next event
    pub async fn recv(&self) -> crate::Result<DeviceEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Wait for the next event from a plain thread
    pub fn recv_blocking(&self) -> crate::Result<DeviceEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the event bridge
///
/// Returns (EventSink for the libusb thread, EventStream for Tokio)
pub fn create_event_bridge() -> (EventSink, EventStream) {
    let (tx, rx) = bounded(64);
    (EventSink { tx }, EventStream { rx })
}
