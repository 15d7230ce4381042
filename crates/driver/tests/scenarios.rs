//! End-to-end behaviour of the read and write paths
//!
//! Drives a `BulkDevice` over the scriptable mock transport:
//! - Healthy writes and reads
//! - In-flight limiting (blocking and nonblocking writers)
//! - Read timeout and cancellation
//! - Data that arrives while a timed-out read is being cancelled
//! - Disconnect while a read is blocked
//! - One-shot delivery of latched transport faults
//! - Interruption of blocked callers
//!
//! Run with: `cargo test -p driver --test scenarios`

use driver::test_utils::{
    DEFAULT_TEST_TIMEOUT, InReply, OutMode, attach_mock, attach_mock_with, fast_config,
};
use driver::{BulkDevice, BulkTransfer, DriverConfig, InterfaceBinding, SubmitError, Transport};
use protocol::{
    ControlRequest, DriverError, Endpoints, MAX_TRANSFER, READ_MAX_LENGTH, TransferId,
    TransferStatus, WRITES_IN_FLIGHT,
};
use std::io::{Read, Write};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

fn patient_config() -> DriverConfig {
    DriverConfig {
        read_timeout: DEFAULT_TEST_TIMEOUT,
        ..fast_config()
    }
}

// ============================================================================
// Write Path
// ============================================================================

#[test]
fn test_write_on_idle_device() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();

    let payload: Vec<u8> = (0..64).collect();
    assert_eq!(handle.write(&payload, false), Ok(64));

    assert!(transport.wait_idle(DEFAULT_TEST_TIMEOUT));
    assert_eq!(transport.written(), payload);
    assert_eq!(device.outstanding_writes(), 0);
}

#[test]
fn test_zero_length_write() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();

    assert_eq!(handle.write(&[], false), Ok(0));
    assert_eq!(transport.submitted_out(), 0);
}

#[test]
fn test_write_truncated_to_one_chunk() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();

    let payload = vec![0x5a; 10_000];
    assert_eq!(handle.write(&payload, false), Ok(MAX_TRANSFER));
    assert!(transport.wait_idle(DEFAULT_TEST_TIMEOUT));
    assert_eq!(transport.written().len(), MAX_TRANSFER);
}

#[test]
fn test_ninth_write_blocks_until_slot_frees() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Hold);
    let handle = device.open().unwrap();

    thread::scope(|s| {
        let writers: Vec<_> = (0..WRITES_IN_FLIGHT + 1)
            .map(|i| {
                let handle = &handle;
                s.spawn(move || handle.write(&[i as u8; 10], false))
            })
            .collect();

        assert!(transport.wait_held_out(WRITES_IN_FLIGHT, DEFAULT_TEST_TIMEOUT));
        thread::sleep(Duration::from_millis(50));

        let finished = writers.iter().filter(|w| w.is_finished()).count();
        assert_eq!(finished, WRITES_IN_FLIGHT);
        assert_eq!(transport.held_out(), WRITES_IN_FLIGHT);

        assert_eq!(transport.complete_out(1, TransferStatus::Completed), 1);
        for writer in writers {
            assert_eq!(writer.join().unwrap(), Ok(10));
        }
    });

    assert_eq!(transport.held_out(), WRITES_IN_FLIGHT);
    assert_eq!(transport.max_in_flight_out(), WRITES_IN_FLIGHT);
}

#[test]
fn test_nonblocking_write_with_all_slots_taken() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Hold);
    let handle = device.open().unwrap();

    for _ in 0..WRITES_IN_FLIGHT {
        assert_eq!(handle.write(b"data", true), Ok(4));
    }
    assert_eq!(handle.write(b"data", true), Err(DriverError::TryAgain));
    assert_eq!(transport.submitted_out(), WRITES_IN_FLIGHT);

    transport.complete_out(1, TransferStatus::Completed);

    let deadline = Instant::now() + DEFAULT_TEST_TIMEOUT;
    let accepted = loop {
        match handle.write(b"data", true) {
            Err(DriverError::TryAgain) if Instant::now() < deadline => thread::yield_now(),
            other => break other,
        }
    };
    assert_eq!(accepted, Ok(4));
}

#[test]
fn test_oversized_write_limit_is_capped() {
    let config = DriverConfig {
        writes_in_flight: 2 * WRITES_IN_FLIGHT,
        ..fast_config()
    };
    let (device, transport) = attach_mock_with(Endpoints::new(0x81, 0x02), config);
    transport.set_out_mode(OutMode::Hold);
    let handle = device.open().unwrap();

    for _ in 0..WRITES_IN_FLIGHT {
        assert_eq!(handle.write(b"data", true), Ok(4));
    }
    assert_eq!(handle.write(b"data", true), Err(DriverError::TryAgain));
    assert_eq!(transport.max_in_flight_out(), WRITES_IN_FLIGHT);
}

#[test]
fn test_write_without_bulk_out() {
    let (device, _transport) = attach_mock_with(
        Endpoints {
            bulk_in: Some(0x81),
            bulk_out: None,
        },
        fast_config(),
    );
    let handle = device.open().unwrap();
    assert_eq!(handle.write(b"x", false), Err(DriverError::NotFound));
}

#[test]
fn test_write_submit_failure_releases_slot() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();

    transport.fail_submissions(Some(DriverError::Io));
    for _ in 0..WRITES_IN_FLIGHT + 2 {
        assert_eq!(handle.write(b"x", true), Err(DriverError::Io));
    }
    assert_eq!(device.outstanding_writes(), 0);

    transport.fail_submissions(None);
    assert_eq!(handle.write(b"x", true), Ok(1));
}

#[test]
fn test_blocked_writer_interrupted() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Hold);
    let handle = device.open().unwrap();

    for _ in 0..WRITES_IN_FLIGHT {
        handle.write(b"x", false).unwrap();
    }

    let interrupter = handle.interrupter();
    thread::scope(|s| {
        let writer = s.spawn(|| handle.write(b"x", false));
        thread::sleep(Duration::from_millis(30));
        interrupter.interrupt();
        assert_eq!(writer.join().unwrap(), Err(DriverError::Interrupted));
    });
    assert_eq!(transport.submitted_out(), WRITES_IN_FLIGHT);
}

#[test]
fn test_io_write_trait() {
    let (device, transport) = attach_mock();
    let mut handle = device.open().unwrap();

    let payload: Vec<u8> = (0..8000u32).map(|i| i as u8).collect();
    handle.write_all(&payload).unwrap();
    Write::flush(&mut handle).unwrap();

    assert_eq!(transport.written(), payload);
}

#[test]
fn test_io_write_nonblocking_would_block() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Hold);
    let mut handle = device.open().unwrap();
    handle.set_nonblocking(true);

    for _ in 0..WRITES_IN_FLIGHT {
        Write::write(&mut handle, b"x").unwrap();
    }
    let err = Write::write(&mut handle, b"x").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
}

// ============================================================================
// Read Path
// ============================================================================

#[test]
fn test_read_delivers_data() {
    let (device, transport) = attach_mock();
    transport.push_in(InReply::Data(b"hello".to_vec()));
    let handle = device.open().unwrap();

    let mut buf = [0u8; 1024];
    assert_eq!(handle.read(&mut buf), Ok(5));
    assert_eq!(&buf[..5], b"hello");
}

#[test]
fn test_read_sized_to_caller_buffer() {
    let (device, transport) = attach_mock();
    transport.push_in(InReply::Data(vec![7; 2000]));
    let handle = device.open().unwrap();

    let mut buf = [0u8; 1024];
    assert_eq!(handle.read(&mut buf), Ok(1024));
}

#[test]
fn test_read_timeout_returns_zero() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();

    let start = Instant::now();
    let mut buf = [0u8; 1024];
    assert_eq!(handle.read(&mut buf), Ok(0));
    assert!(start.elapsed() >= fast_config().read_timeout);

    // The timed-out transfer was cancelled and reaped
    assert_eq!(transport.cancel_requests().len(), 1);
    assert!(!transport.held_in());
    assert!(!device.read_in_flight());
}

#[test]
fn test_read_rejects_unserviceable_lengths() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();

    assert_eq!(handle.read(&mut []), Ok(0));
    let mut huge = vec![0u8; READ_MAX_LENGTH + 1];
    assert_eq!(handle.read(&mut huge), Ok(0));
    assert_eq!(transport.submitted_in(), 0);
}

#[test]
fn test_read_without_bulk_in() {
    let (device, transport) = attach_mock_with(
        Endpoints {
            bulk_in: None,
            bulk_out: Some(0x02),
        },
        fast_config(),
    );
    let handle = device.open().unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(handle.read(&mut buf), Ok(0));
    assert_eq!(transport.submitted_in(), 0);
}

#[test]
fn test_read_submit_failure() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();
    let mut buf = [0u8; 16];

    transport.fail_submissions(Some(DriverError::NoMemory));
    assert_eq!(handle.read(&mut buf), Err(DriverError::NoMemory));

    transport.fail_submissions(Some(DriverError::Busy));
    assert_eq!(handle.read(&mut buf), Err(DriverError::Io));

    // The buffer survived both failures
    transport.fail_submissions(None);
    transport.push_in(InReply::Data(b"ok".to_vec()));
    assert_eq!(handle.read(&mut buf), Ok(2));
}

#[test]
fn test_one_inbound_transfer_at_a_time() {
    let (device, transport) = attach_mock_with(Endpoints::new(0x81, 0x02), patient_config());
    let handle = device.open().unwrap();

    thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let handle = &handle;
                s.spawn(move || {
                    let mut buf = [0u8; 64];
                    handle.read(&mut buf)
                })
            })
            .collect();

        for i in 0..4u8 {
            assert!(transport.wait_held_in(DEFAULT_TEST_TIMEOUT));
            transport.push_in(InReply::Data(vec![i; 8]));
        }
        for reader in readers {
            assert_eq!(reader.join().unwrap(), Ok(8));
        }
    });

    assert_eq!(transport.max_in_flight_in(), 1);
    assert_eq!(transport.submitted_in(), 4);
}

#[test]
fn test_blocked_reader_interrupted() {
    let (device, transport) = attach_mock_with(Endpoints::new(0x81, 0x02), patient_config());
    let handle = device.open().unwrap();
    let interrupter = handle.interrupter();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 64];
            handle.read(&mut buf)
        });
        assert!(transport.wait_held_in(DEFAULT_TEST_TIMEOUT));
        interrupter.interrupt();
        assert_eq!(reader.join().unwrap(), Err(DriverError::Interrupted));
    });

    assert!(!device.read_in_flight());
    assert_eq!(transport.cancel_requests().len(), 1);
}

#[test]
fn test_io_read_trait() {
    let (device, transport) = attach_mock();
    transport.push_in(InReply::Data(b"stream".to_vec()));
    let mut handle = device.open().unwrap();

    let mut buf = vec![0u8; 2 * READ_MAX_LENGTH];
    assert_eq!(Read::read(&mut handle, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"stream");
}

/// Holds the inbound transfer and fills it with data when asked to cancel,
/// like a host controller that finishes the transfer just as the deadline hits
#[derive(Default)]
struct LateDataTransport {
    held_in: Mutex<Option<BulkTransfer>>,
    late_data: Mutex<Option<Vec<u8>>>,
}

impl LateDataTransport {
    fn attach(late_data: &[u8], config: DriverConfig) -> BulkDevice<Self> {
        let transport = Self {
            late_data: Mutex::new(Some(late_data.to_vec())),
            ..Self::default()
        };
        let binding = InterfaceBinding {
            number: 0,
            endpoints: Endpoints::new(0x81, 0x02),
        };
        BulkDevice::attach(transport, binding, config).unwrap()
    }
}

impl Transport for LateDataTransport {
    fn submit(&self, transfer: BulkTransfer) -> Result<(), SubmitError> {
        *self.held_in.lock().unwrap() = Some(transfer);
        Ok(())
    }

    fn cancel(&self, id: TransferId) {
        let Some(mut transfer) = self.held_in.lock().unwrap().take() else {
            return;
        };
        assert_eq!(transfer.id(), id);
        let late = self.late_data.lock().unwrap().take();
        thread::spawn(move || match late {
            Some(data) => {
                let n = data.len().min(transfer.length());
                transfer.data_mut()[..n].copy_from_slice(&data[..n]);
                transfer.complete(TransferStatus::Completed, n);
            }
            None => transfer.complete(TransferStatus::Cancelled, 0),
        });
    }

    fn control_in(&self, _: ControlRequest, _: &mut [u8]) -> Result<usize, TransferStatus> {
        Err(TransferStatus::Stall)
    }

    fn control_out(&self, _: ControlRequest, data: &[u8]) -> Result<usize, TransferStatus> {
        Ok(data.len())
    }
}

#[test]
fn test_data_completed_during_timeout_cancel_is_delivered() {
    let device = LateDataTransport::attach(b"DATA", fast_config());
    let handle = device.open().unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(handle.read(&mut buf), Ok(4));
    assert_eq!(&buf[..4], b"DATA");
    assert!(!device.read_in_flight());

    // Nothing more on the wire: a plain timeout again
    assert_eq!(handle.read(&mut buf), Ok(0));
}

#[test]
fn test_data_completed_during_interrupt_cancel_is_delivered() {
    let device = LateDataTransport::attach(b"DATA", patient_config());
    let handle = device.open().unwrap();
    let interrupter = handle.interrupter();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 64];
            handle.read(&mut buf).map(|n| buf[..n].to_vec())
        });
        while device.transport().held_in.lock().unwrap().is_none() {
            thread::sleep(Duration::from_millis(1));
        }
        interrupter.interrupt();
        assert_eq!(reader.join().unwrap(), Ok(b"DATA".to_vec()));
    });
}

// ============================================================================
// Disconnect
// ============================================================================

#[test]
fn test_disconnect_while_read_blocked() {
    let (device, transport) = attach_mock_with(Endpoints::new(0x81, 0x02), patient_config());
    let handle = device.open().unwrap();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = [0u8; 1024];
            handle.read(&mut buf)
        });
        assert!(transport.wait_held_in(DEFAULT_TEST_TIMEOUT));

        device.disconnect();
        assert_eq!(reader.join().unwrap(), Err(DriverError::NotFound));
    });

    assert_eq!(transport.cancel_requests().len(), 1);
    assert!(!transport.held_in());
}

#[test]
fn test_no_completions_after_disconnect() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Hold);
    let handle = device.open().unwrap();

    for _ in 0..3 {
        handle.write(b"abc", false).unwrap();
    }
    device.disconnect();

    let scheduled = transport.callbacks_started();
    assert_eq!(scheduled, 3);
    assert_eq!(transport.held_out(), 0);

    let mut buf = [0u8; 16];
    assert_eq!(handle.read(&mut buf), Err(DriverError::NotFound));
    assert_eq!(handle.write(b"abc", false), Err(DriverError::NotFound));
    assert_eq!(handle.write(b"abc", true), Err(DriverError::NotFound));

    thread::sleep(Duration::from_millis(20));
    assert_eq!(transport.callbacks_started(), scheduled);
}

#[test]
fn test_disconnect_wakes_blocked_writer() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Hold);
    let handle = device.open().unwrap();

    for _ in 0..WRITES_IN_FLIGHT {
        handle.write(b"x", false).unwrap();
    }

    thread::scope(|s| {
        let writer = s.spawn(|| handle.write(b"x", false));
        thread::sleep(Duration::from_millis(30));
        device.disconnect();
        assert_eq!(writer.join().unwrap(), Err(DriverError::NotFound));
    });
}

// ============================================================================
// Latched Faults
// ============================================================================

#[test]
fn test_write_stall_reported_once() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Complete(TransferStatus::Stall));
    let handle = device.open().unwrap();

    // Accepted; the stall shows up later
    assert_eq!(handle.write(b"abcd", false), Ok(4));
    assert!(transport.wait_idle(DEFAULT_TEST_TIMEOUT));

    transport.set_out_mode(OutMode::Complete(TransferStatus::Completed));
    assert_eq!(handle.write(b"abcd", false), Err(DriverError::PipeStall));
    assert_eq!(handle.write(b"abcd", false), Ok(4));
}

#[test]
fn test_read_stall_reported_once() {
    let (device, transport) = attach_mock();
    transport.push_in(InReply::Status(TransferStatus::Stall));
    transport.push_in(InReply::Data(b"after".to_vec()));
    let handle = device.open().unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(handle.read(&mut buf), Err(DriverError::PipeStall));
    assert_eq!(handle.read(&mut buf), Ok(5));
}

#[test]
fn test_write_fault_surfaces_on_read() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Complete(TransferStatus::Error));
    let handle = device.open().unwrap();

    handle.write(b"x", false).unwrap();
    assert!(transport.wait_idle(DEFAULT_TEST_TIMEOUT));

    transport.push_in(InReply::Data(b"y".to_vec()));
    let mut buf = [0u8; 8];
    assert_eq!(handle.read(&mut buf), Err(DriverError::Io));
    assert_eq!(device.pending_fault(), None);
}

#[test]
fn test_cancellation_is_not_a_fault() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(handle.read(&mut buf), Ok(0));
    assert_eq!(device.pending_fault(), None);

    transport.push_in(InReply::Data(b"z".to_vec()));
    assert_eq!(handle.read(&mut buf), Ok(1));
}

#[test]
fn test_device_state_outlives_attachment() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();
    assert_eq!(device.ref_count(), 2);

    device.disconnect();
    // The open handle still holds the state and the transport
    assert_eq!(transport.handle_count(), 2);

    drop(handle);
    assert_eq!(transport.handle_count(), 1);
}
