//! Concurrency stress tests
//!
//! Many writers and a reader hammer one device while completions arrive with
//! random delays. Checks the in-flight bound, exactly-once fault delivery,
//! and that teardown mid-traffic leaves nothing behind.
//!
//! Run with: `cargo test -p driver --test stress_tests`

use driver::test_utils::{DEFAULT_TEST_TIMEOUT, InReply, OutMode, attach_mock};
use protocol::{DriverError, Fault, TransferStatus, WRITES_IN_FLIGHT};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_writers_never_exceed_in_flight_bound() {
    let (device, transport) = attach_mock();
    transport.set_jitter(Some(Duration::from_millis(2)));
    let handle = device.open().unwrap();
    let accepted = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in 0..16u8 {
            let handle = &handle;
            let accepted = &accepted;
            s.spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..25 {
                    let len = rng.random_range(1..=64);
                    let n = handle.write(&vec![t; len], false).unwrap();
                    assert_eq!(n, len);
                    accepted.fetch_add(n, Ordering::Relaxed);
                }
            });
        }
    });

    assert_eq!(handle.flush(), Ok(()));
    assert!(transport.max_in_flight_out() <= WRITES_IN_FLIGHT);
    assert_eq!(transport.submitted_out(), 16 * 25);
    assert_eq!(transport.written().len(), accepted.load(Ordering::Relaxed));
    assert_eq!(device.outstanding_writes(), 0);
}

#[test]
fn test_held_writers_released_in_random_batches() {
    let (device, transport) = attach_mock();
    transport.set_out_mode(OutMode::Hold);
    let handle = device.open().unwrap();
    let done = AtomicBool::new(false);
    const TOTAL: usize = 100;

    thread::scope(|s| {
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let handle = &handle;
                s.spawn(move || {
                    for _ in 0..TOTAL / 4 {
                        handle.write(b"payload", false).unwrap();
                    }
                })
            })
            .collect();

        s.spawn(|| {
            let mut rng = rand::rng();
            while !done.load(Ordering::Acquire) {
                assert!(transport.held_out() <= WRITES_IN_FLIGHT);
                transport.complete_out(rng.random_range(1..=3), TransferStatus::Completed);
                thread::sleep(Duration::from_micros(rng.random_range(50..500)));
            }
        });

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    transport.complete_out(WRITES_IN_FLIGHT, TransferStatus::Completed);
    assert!(transport.wait_idle(DEFAULT_TEST_TIMEOUT));
    assert!(transport.max_in_flight_out() <= WRITES_IN_FLIGHT);
    assert_eq!(transport.written().len(), TOTAL * b"payload".len());
}

#[test]
fn test_fault_delivered_to_exactly_one_caller() {
    let (device, transport) = attach_mock();
    let handle = device.open().unwrap();

    for _ in 0..20 {
        transport.set_out_mode(OutMode::Complete(TransferStatus::Stall));
        handle.write(b"x", false).unwrap();
        assert!(transport.wait_idle(DEFAULT_TEST_TIMEOUT));
        assert_eq!(device.pending_fault(), Some(Fault::Stall));
        transport.set_out_mode(OutMode::Complete(TransferStatus::Completed));

        let stalls = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..6 {
                let handle = &handle;
                let stalls = &stalls;
                s.spawn(move || match handle.write(b"y", false) {
                    Err(DriverError::PipeStall) => {
                        stalls.fetch_add(1, Ordering::Relaxed);
                    }
                    other => assert_eq!(other, Ok(1)),
                });
            }
        });
        assert_eq!(stalls.load(Ordering::Relaxed), 1);
        assert!(transport.wait_idle(DEFAULT_TEST_TIMEOUT));
    }
}

#[test]
fn test_disconnect_during_traffic() {
    let (device, transport) = attach_mock();
    transport.set_jitter(Some(Duration::from_millis(3)));
    let handle = device.open().unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..4 {
            let handle = &handle;
            let stop = &stop;
            s.spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    match handle.write(b"traffic", false) {
                        Ok(_) => {}
                        Err(DriverError::NotFound) => break,
                        Err(e) => panic!("unexpected write error: {}", e),
                    }
                }
            });
        }

        let reader = s.spawn(|| {
            let mut buf = [0u8; 256];
            loop {
                match handle.read(&mut buf) {
                    Ok(_) => transport.push_in(InReply::Data(b"more".to_vec())),
                    Err(DriverError::NotFound) => break,
                    Err(e) => panic!("unexpected read error: {}", e),
                }
            }
        });
        transport.push_in(InReply::Data(b"first".to_vec()));

        thread::sleep(Duration::from_millis(50));
        device.disconnect();
        stop.store(true, Ordering::Release);
        reader.join().unwrap();
    });

    let scheduled = transport.callbacks_started();
    assert!(transport.wait_idle(DEFAULT_TEST_TIMEOUT));
    assert_eq!(transport.callbacks_started(), scheduled);
    assert_eq!(transport.in_flight(), 0);
}
