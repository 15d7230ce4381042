//! Scriptable in-memory transport for exercising the engine
//!
//! [`MockTransport`] completes transfers from its own spawned threads, the
//! same way a host controller completes them from interrupt context. Tests
//! decide whether outbound transfers complete on their own or are held until
//! released, and queue inbound replies ahead of time or deliver them to a
//! read that is already waiting.
//!
//! # Example
//!
//! ```
//! use driver::test_utils::{InReply, attach_mock};
//!
//! let (device, transport) = attach_mock();
//! transport.push_in(InReply::Data(b"ping".to_vec()));
//!
//! let handle = device.open().unwrap();
//! let mut buf = [0u8; 64];
//! assert_eq!(handle.read(&mut buf).unwrap(), 4);
//! assert_eq!(&buf[..4], b"ping");
//! ```

use crate::access::lock;
use crate::config::DriverConfig;
use crate::device::{BulkDevice, InterfaceBinding};
use crate::transport::{BulkTransfer, SubmitError, Transport};
use protocol::descriptor::{DT_STRING, REQ_GET_DESCRIPTOR};
use protocol::{ControlRequest, Direction, DriverError, Endpoints, TransferId, TransferStatus};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk-in endpoint used by [`attach_mock`]
pub const MOCK_BULK_IN: u8 = 0x81;

/// Bulk-out endpoint used by [`attach_mock`]
pub const MOCK_BULK_OUT: u8 = 0x02;

/// What happens to outbound transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutMode {
    /// Complete right away with the given status
    Complete(TransferStatus),
    /// Keep until [`MockTransport::complete_out`] or a cancel
    Hold,
}

/// One scripted reply to an inbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InReply {
    Data(Vec<u8>),
    Status(TransferStatus),
}

#[derive(Debug)]
struct MockState {
    out_mode: OutMode,
    held_out: VecDeque<BulkTransfer>,
    held_in: Option<BulkTransfer>,
    in_replies: VecDeque<InReply>,
    in_flight_in: usize,
    in_flight_out: usize,
    max_in_flight_in: usize,
    max_in_flight_out: usize,
    submitted_in: usize,
    submitted_out: usize,
    written: Vec<u8>,
    cancel_requests: Vec<TransferId>,
    fail_submissions: Option<DriverError>,
    fail_power: Option<DriverError>,
    jitter: Option<Duration>,
    strings: HashMap<u8, Vec<u8>>,
    control_replies: VecDeque<Result<Vec<u8>, TransferStatus>>,
    control_log: Vec<ControlRequest>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            out_mode: OutMode::Complete(TransferStatus::Completed),
            held_out: VecDeque::new(),
            held_in: None,
            in_replies: VecDeque::new(),
            in_flight_in: 0,
            in_flight_out: 0,
            max_in_flight_in: 0,
            max_in_flight_out: 0,
            submitted_in: 0,
            submitted_out: 0,
            written: Vec::new(),
            cancel_requests: Vec::new(),
            fail_submissions: None,
            fail_power: None,
            jitter: None,
            strings: HashMap::new(),
            control_replies: VecDeque::new(),
            control_log: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<MockState>,
    changed: Condvar,
    callbacks_started: AtomicUsize,
    callbacks_finished: AtomicUsize,
    power_gets: AtomicUsize,
    power_puts: AtomicUsize,
}

/// In-memory [`Transport`]; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clones alive, the device's included
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn set_out_mode(&self, mode: OutMode) {
        lock(&self.inner.state).out_mode = mode;
    }

    /// Delay every completion by a random amount up to `max`
    pub fn set_jitter(&self, max: Option<Duration>) {
        lock(&self.inner.state).jitter = max;
    }

    /// Reject every submission with `error` until cleared
    pub fn fail_submissions(&self, error: Option<DriverError>) {
        lock(&self.inner.state).fail_submissions = error;
    }

    /// Make `power_get` fail with `error` until cleared
    pub fn fail_power(&self, error: Option<DriverError>) {
        lock(&self.inner.state).fail_power = error;
    }

    /// Answer the waiting inbound transfer, or the next one submitted
    pub fn push_in(&self, reply: InReply) {
        let mut state = lock(&self.inner.state);
        match state.held_in.take() {
            Some(transfer) => {
                let jitter = state.jitter;
                drop(state);
                self.finish_in(transfer, reply, jitter);
            }
            None => state.in_replies.push_back(reply),
        }
    }

    /// Complete up to `count` held outbound transfers, oldest first
    ///
    /// Returns how many were completed.
    pub fn complete_out(&self, count: usize, status: TransferStatus) -> usize {
        let mut state = lock(&self.inner.state);
        let n = count.min(state.held_out.len());
        let batch: Vec<BulkTransfer> = state.held_out.drain(..n).collect();
        if status.is_success() {
            for transfer in &batch {
                let data = transfer.data().to_vec();
                state.written.extend_from_slice(&data);
            }
        }
        let jitter = state.jitter;
        drop(state);

        for transfer in batch {
            let len = match status {
                TransferStatus::Completed => transfer.length(),
                _ => 0,
            };
            self.finish(transfer, status, len, jitter);
        }
        n
    }

    pub fn held_out(&self) -> usize {
        lock(&self.inner.state).held_out.len()
    }

    pub fn held_in(&self) -> bool {
        lock(&self.inner.state).held_in.is_some()
    }

    /// Transfers accepted whose callbacks have not started
    pub fn in_flight(&self) -> usize {
        let state = lock(&self.inner.state);
        state.in_flight_in + state.in_flight_out
    }

    pub fn max_in_flight_in(&self) -> usize {
        lock(&self.inner.state).max_in_flight_in
    }

    pub fn max_in_flight_out(&self) -> usize {
        lock(&self.inner.state).max_in_flight_out
    }

    pub fn submitted_in(&self) -> usize {
        lock(&self.inner.state).submitted_in
    }

    pub fn submitted_out(&self) -> usize {
        lock(&self.inner.state).submitted_out
    }

    /// Payload of every outbound transfer that completed successfully
    pub fn written(&self) -> Vec<u8> {
        lock(&self.inner.state).written.clone()
    }

    pub fn cancel_requests(&self) -> Vec<TransferId> {
        lock(&self.inner.state).cancel_requests.clone()
    }

    /// Completions scheduled so far
    pub fn callbacks_started(&self) -> usize {
        self.inner.callbacks_started.load(Ordering::SeqCst)
    }

    /// Completion callbacks that have returned
    pub fn callbacks_finished(&self) -> usize {
        self.inner.callbacks_finished.load(Ordering::SeqCst)
    }

    pub fn power_gets(&self) -> usize {
        self.inner.power_gets.load(Ordering::SeqCst)
    }

    pub fn power_puts(&self) -> usize {
        self.inner.power_puts.load(Ordering::SeqCst)
    }

    /// Serve `raw` for GET_DESCRIPTOR(STRING, `index`)
    pub fn set_string(&self, index: u8, raw: Vec<u8>) {
        lock(&self.inner.state).strings.insert(index, raw);
    }

    /// Queue a reply that overrides the next control request
    pub fn push_control_reply(&self, reply: Result<Vec<u8>, TransferStatus>) {
        lock(&self.inner.state).control_replies.push_back(reply);
    }

    pub fn control_log(&self) -> Vec<ControlRequest> {
        lock(&self.inner.state).control_log.clone()
    }

    /// Wait until `count` outbound transfers are held
    pub fn wait_held_out(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.held_out.len() >= count)
    }

    /// Wait until an inbound transfer is held
    pub fn wait_held_in(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.held_in.is_some())
    }

    /// Wait until every callback that started has also returned
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.wait_until(Duration::ZERO, |state| {
                state.in_flight_in == 0 && state.in_flight_out == 0
            }) && self.callbacks_started() == self.callbacks_finished();
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_until(&self, timeout: Duration, ready: impl Fn(&MockState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        while !ready(&state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn finish_in(&self, mut transfer: BulkTransfer, reply: InReply, jitter: Option<Duration>) {
        match reply {
            InReply::Data(data) => {
                let n = data.len().min(transfer.length());
                transfer.data_mut()[..n].copy_from_slice(&data[..n]);
                self.finish(transfer, TransferStatus::Completed, n, jitter);
            }
            InReply::Status(status) => self.finish(transfer, status, 0, jitter),
        }
    }

    /// Run the completion on a fresh thread
    fn finish(
        &self,
        transfer: BulkTransfer,
        status: TransferStatus,
        len: usize,
        jitter: Option<Duration>,
    ) {
        let inner = Arc::clone(&self.inner);
        inner.callbacks_started.fetch_add(1, Ordering::SeqCst);
        thread::spawn(move || {
            if let Some(max) = jitter {
                let micros = rand::rng().random_range(0..=max.as_micros() as u64);
                thread::sleep(Duration::from_micros(micros));
            }
            {
                let mut state = lock(&inner.state);
                match transfer.direction() {
                    Direction::In => state.in_flight_in -= 1,
                    Direction::Out => state.in_flight_out -= 1,
                }
            }
            transfer.complete(status, len);
            inner.callbacks_finished.fetch_add(1, Ordering::SeqCst);
            let _state = lock(&inner.state);
            inner.changed.notify_all();
        });
    }
}

impl Transport for MockTransport {
    fn submit(&self, transfer: BulkTransfer) -> Result<(), SubmitError> {
        let mut state = lock(&self.inner.state);
        if let Some(error) = state.fail_submissions {
            return Err(SubmitError::new(error, transfer));
        }
        let jitter = state.jitter;

        match transfer.direction() {
            Direction::In => {
                state.submitted_in += 1;
                state.in_flight_in += 1;
                state.max_in_flight_in = state.max_in_flight_in.max(state.in_flight_in);
                if let Some(reply) = state.in_replies.pop_front() {
                    drop(state);
                    self.finish_in(transfer, reply, jitter);
                } else {
                    state.held_in = Some(transfer);
                    self.inner.changed.notify_all();
                }
            }
            Direction::Out => {
                state.submitted_out += 1;
                state.in_flight_out += 1;
                state.max_in_flight_out = state.max_in_flight_out.max(state.in_flight_out);
                match state.out_mode {
                    OutMode::Complete(status) => {
                        let len = if status.is_success() {
                            let data = transfer.data().to_vec();
                            state.written.extend_from_slice(&data);
                            transfer.length()
                        } else {
                            0
                        };
                        drop(state);
                        self.finish(transfer, status, len, jitter);
                    }
                    OutMode::Hold => {
                        state.held_out.push_back(transfer);
                        self.inner.changed.notify_all();
                    }
                }
            }
        }
        Ok(())
    }

    fn cancel(&self, id: TransferId) {
        let mut state = lock(&self.inner.state);
        state.cancel_requests.push(id);

        let victim = if state.held_in.as_ref().is_some_and(|t| t.id() == id) {
            state.held_in.take()
        } else if let Some(pos) = state.held_out.iter().position(|t| t.id() == id) {
            state.held_out.remove(pos)
        } else {
            None
        };
        drop(state);

        if let Some(transfer) = victim {
            self.finish(transfer, TransferStatus::Cancelled, 0, None);
        }
    }

    fn control_in(
        &self,
        request: ControlRequest,
        buf: &mut [u8],
    ) -> Result<usize, TransferStatus> {
        let mut state = lock(&self.inner.state);
        state.control_log.push(request);

        let reply = match state.control_replies.pop_front() {
            Some(reply) => reply,
            None => {
                let is_string = request.request == REQ_GET_DESCRIPTOR
                    && (request.value >> 8) as u8 == DT_STRING;
                let index = (request.value & 0xff) as u8;
                match state.strings.get(&index) {
                    Some(raw) if is_string => Ok(raw.clone()),
                    _ => Err(TransferStatus::Stall),
                }
            }
        };

        reply.map(|data| {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            n
        })
    }

    fn control_out(&self, request: ControlRequest, data: &[u8]) -> Result<usize, TransferStatus> {
        let mut state = lock(&self.inner.state);
        state.control_log.push(request);
        match state.control_replies.pop_front() {
            Some(Err(status)) => Err(status),
            _ => Ok(data.len()),
        }
    }

    fn power_get(&self) -> Result<(), DriverError> {
        if let Some(error) = lock(&self.inner.state).fail_power {
            return Err(error);
        }
        self.inner.power_gets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn power_put(&self) {
        self.inner.power_puts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Config with a short read timeout so timeout paths finish quickly
pub fn fast_config() -> DriverConfig {
    DriverConfig {
        read_timeout: Duration::from_millis(100),
        drain_timeout: Duration::from_millis(100),
        ..DriverConfig::default()
    }
}

/// Attach a fresh mock device with both endpoints and [`fast_config`]
pub fn attach_mock() -> (BulkDevice<MockTransport>, MockTransport) {
    attach_mock_with(Endpoints::new(MOCK_BULK_IN, MOCK_BULK_OUT), fast_config())
}

pub fn attach_mock_with(
    endpoints: Endpoints,
    config: DriverConfig,
) -> (BulkDevice<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let binding = InterfaceBinding {
        number: 0,
        endpoints,
    };
    match BulkDevice::attach(transport.clone(), binding, config) {
        Ok(device) => (device, transport),
        Err(e) => panic!("mock attach failed: {}", e),
    }
}
