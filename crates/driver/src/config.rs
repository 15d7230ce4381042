//! Driver tuning parameters

use protocol::{DRAIN_TIMEOUT_MS, MAX_TRANSFER, READ_MAX_LENGTH, READ_TIMEOUT_MS, WRITES_IN_FLIGHT};
use std::time::Duration;

/// Tuning knobs of one attached device
///
/// The defaults reproduce the constants the device firmware was qualified
/// against; front ends may override them from their configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// How long a read waits for its inbound transfer
    pub read_timeout: Duration,
    /// How long a drain lets outstanding writes finish before cancelling them
    pub drain_timeout: Duration,
    /// Outbound transfers allowed in flight at once
    pub writes_in_flight: usize,
    /// Capacity of the reusable inbound buffer
    pub read_buffer_size: usize,
    /// Largest chunk accepted by a single write
    pub max_transfer: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(READ_TIMEOUT_MS),
            drain_timeout: Duration::from_millis(DRAIN_TIMEOUT_MS),
            writes_in_flight: WRITES_IN_FLIGHT,
            read_buffer_size: READ_MAX_LENGTH,
            max_transfer: MAX_TRANSFER,
        }
    }
}

impl DriverConfig {
    /// Clamp values into ranges the engine can honour
    pub fn sanitized(mut self) -> Self {
        self.writes_in_flight = self.writes_in_flight.clamp(1, WRITES_IN_FLIGHT);
        self.read_buffer_size = self.read_buffer_size.clamp(1, READ_MAX_LENGTH);
        self.max_transfer = self.max_transfer.max(1);
        self
    }
}
