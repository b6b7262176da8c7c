//! Fix store shared between threads the way the firmware tasks share it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use tracker_core::network::SharedNetwork;
use tracker_core::storage::{FixFlags, FixRecord, FixStore, StoreError};

const PUSHES: u32 = 2_000;

fn fix(ts: u32) -> FixRecord {
    FixRecord::new(ts, 488_566_000, 23_522_000, 90, FixFlags::GPS_VALID)
}

/// Retries while another thread holds the store.
fn retry<T>(mut op: impl FnMut() -> Result<T, StoreError>) -> T {
    loop {
        match op() {
            Ok(value) => return value,
            Err(StoreError::Busy) => thread::yield_now(),
        }
    }
}

#[test]
fn concurrent_push_and_batch_stay_consistent() {
    let store = FixStore::<CriticalSectionRawMutex>::new(256);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..PUSHES {
                retry(|| store.push(fix(1_700_000_000 + i)));
            }
            done.store(true, Ordering::Release);
        });

        // Uploader: every batch must be strictly ordered with consecutive
        // sequence numbers, and acknowledging it may only raise the watermark.
        s.spawn(|| {
            let mut last_watermark = 0;
            while !done.load(Ordering::Acquire) {
                let watermark = retry(|| store.acked_watermark());
                assert!(watermark >= last_watermark);
                last_watermark = watermark;

                let batch = retry(|| store.batch_after(60, watermark));
                assert!(batch.len() <= 60);
                for pair in batch.windows(2) {
                    assert_eq!(pair[1].sequence, pair[0].sequence + 1);
                    assert!(pair[1].timestamp > pair[0].timestamp);
                }
                assert!(batch.iter().all(|r| r.timestamp > watermark));

                if let Some(newest) = batch.last() {
                    retry(|| store.set_acked_watermark(newest.timestamp));
                }
            }
        });

        // A stale acknowledgment racing the uploader never lowers the mark.
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                retry(|| store.set_acked_watermark(1_700_000_000));
                thread::yield_now();
            }
        });
    });

    assert_eq!(store.len(), Ok(256));
    let latest = store.latest().unwrap().unwrap();
    assert_eq!(latest.sequence, PUSHES);
    assert_eq!(latest.timestamp, 1_700_000_000 + PUSHES - 1);
    assert!(store.acked_watermark().unwrap() >= 1_700_000_000);
}

#[test]
fn upload_permits_balance_across_threads() {
    let network = SharedNetwork::<CriticalSectionRawMutex>::new();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..500 {
                    if let Ok(permit) = network.begin_upload() {
                        assert!(network.active_uploads() >= 1);
                        drop(permit);
                    }
                }
            });
        }
    });

    assert_eq!(network.active_uploads(), 0);
    assert!(network.accepts_uploads());
}
