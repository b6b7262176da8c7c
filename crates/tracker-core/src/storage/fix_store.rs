use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use log::debug;
use thiserror_no_std::Error;

use alloc::vec;
use alloc::vec::Vec;

use super::FixRecord;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The store lock could not be taken. Transient: retry on the next cycle.
    #[error("fix store is busy")]
    Busy,
}

/// Ring state guarded by the store lock.
struct Ring {
    slots: Vec<FixRecord>,
    /// Next write position
    head: usize,
    /// Valid records in the ring (<= slots.len())
    count: usize,
    next_sequence: u32,
    /// Highest timestamp confirmed by the backend
    acked_watermark: u32,
}

impl Ring {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn oldest_index(&self) -> usize {
        (self.head + self.capacity() - self.count) % self.capacity()
    }

    fn push(&mut self, mut record: FixRecord) -> FixRecord {
        record.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        if self.count == self.capacity() {
            let evicted = &self.slots[self.head];
            if evicted.timestamp > self.acked_watermark {
                debug!(
                    "Evicting unacknowledged fix seq={} ts={}",
                    evicted.sequence, evicted.timestamp
                );
            }
        }

        // When full the oldest record sits at head and is overwritten.
        self.slots[self.head] = record;
        self.head = (self.head + 1) % self.capacity();
        if self.count < self.capacity() {
            self.count += 1;
        }

        record
    }

    fn iter_oldest_first(&self) -> impl Iterator<Item = &FixRecord> {
        let start = self.oldest_index();
        let capacity = self.capacity();
        (0..self.count).map(move |i| &self.slots[(start + i) % capacity])
    }
}

/// Fixed-capacity ring buffer of [`FixRecord`]s shared by the sampler and
/// both uplink pipelines.
///
/// Every operation takes the store lock for its own duration only and never
/// holds it across I/O, so a batch read can never observe a half-written
/// record. When the ring is full the oldest record is overwritten whether or
/// not it was ever acknowledged.
///
/// ## Usage
///
/// ```rust,ignore
/// static STORE: StaticCell<FixStore<CriticalSectionRawMutex>> = StaticCell::new();
/// let store = STORE.init(FixStore::new(DEFAULT_CAPACITY));
///
/// store.push(record)?;
/// let batch = store.batch_after(MAX_UPLOAD_BATCH, store.acked_watermark()?)?;
/// ```
pub struct FixStore<M: RawMutex> {
    ring: Mutex<M, RefCell<Ring>>,
}

impl<M: RawMutex> FixStore<M> {
    /// Creates a store holding at most `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(RefCell::new(Ring {
                slots: vec![FixRecord::default(); capacity],
                head: 0,
                count: 0,
                next_sequence: 1,
                acked_watermark: 0,
            })),
        }
    }

    fn with_ring<R>(&self, f: impl FnOnce(&mut Ring) -> R) -> Result<R, StoreError> {
        self.ring.lock(|cell| {
            let mut ring = cell.try_borrow_mut().map_err(|_| StoreError::Busy)?;
            Ok(f(&mut ring))
        })
    }

    /// Assigns the next sequence number and stores the record, evicting the
    /// oldest one when full. Returns the record as stored.
    pub fn push(&self, record: FixRecord) -> Result<FixRecord, StoreError> {
        self.with_ring(|ring| ring.push(record))
    }

    /// Most recently pushed record, if any.
    pub fn latest(&self) -> Result<Option<FixRecord>, StoreError> {
        self.with_ring(|ring| {
            if ring.count == 0 {
                None
            } else {
                let idx = (ring.head + ring.capacity() - 1) % ring.capacity();
                Some(ring.slots[idx])
            }
        })
    }

    /// Up to `max_count` records with `timestamp > after_timestamp`, oldest
    /// first (ascending sequence).
    ///
    /// Filtering is by timestamp rather than position because the clock may
    /// jump once GPS time becomes available.
    pub fn batch_after(
        &self,
        max_count: usize,
        after_timestamp: u32,
    ) -> Result<Vec<FixRecord>, StoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        self.with_ring(|ring| {
            ring.iter_oldest_first()
                .filter(|record| record.timestamp > after_timestamp)
                .take(max_count)
                .copied()
                .collect()
        })
    }

    /// Highest timestamp the backend has confirmed (0 before any ACK).
    pub fn acked_watermark(&self) -> Result<u32, StoreError> {
        self.with_ring(|ring| ring.acked_watermark)
    }

    /// Raises the watermark to `timestamp`. Lower values are ignored, which
    /// makes duplicate or reordered acknowledgments harmless.
    ///
    /// Returns whether the watermark moved.
    pub fn set_acked_watermark(&self, timestamp: u32) -> Result<bool, StoreError> {
        self.with_ring(|ring| {
            if timestamp > ring.acked_watermark {
                ring.acked_watermark = timestamp;
                true
            } else {
                false
            }
        })
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        self.with_ring(|ring| ring.count)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.len().map(|len| len == 0)
    }

    pub fn capacity(&self) -> Result<usize, StoreError> {
        self.with_ring(|ring| ring.capacity())
    }

    /// Timestamp of the oldest record still held.
    pub fn oldest_timestamp(&self) -> Result<Option<u32>, StoreError> {
        self.with_ring(|ring| ring.iter_oldest_first().next().map(|r| r.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FixFlags;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    fn fix(ts: u32) -> FixRecord {
        FixRecord::new(ts, 488_566_000, 23_522_000, 80, FixFlags::GPS_VALID)
    }

    #[test]
    fn test_empty_store() {
        let store = FixStore::<NoopRawMutex>::new(4);
        assert_eq!(store.len(), Ok(0));
        assert_eq!(store.is_empty(), Ok(true));
        assert_eq!(store.latest(), Ok(None));
        assert_eq!(store.oldest_timestamp(), Ok(None));
        assert_eq!(store.acked_watermark(), Ok(0));
        assert_eq!(store.batch_after(10, 0), Ok(Vec::new()));
    }

    #[test]
    fn test_sequence_is_monotonic_across_eviction() {
        let store = FixStore::<NoopRawMutex>::new(3);
        let mut previous = store.push(fix(1000)).unwrap().sequence;
        assert_eq!(previous, 1);

        for i in 1..10 {
            let seq = store.push(fix(1000 + i)).unwrap().sequence;
            assert_eq!(seq, previous + 1);
            previous = seq;
        }
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let capacity = 5;
        let store = FixStore::<NoopRawMutex>::new(capacity);
        for i in 0..=capacity as u32 {
            store.push(fix(2000 + i)).unwrap();
        }

        assert_eq!(store.len(), Ok(capacity));
        assert_eq!(store.oldest_timestamp(), Ok(Some(2001)));

        let all = store.batch_after(100, 0).unwrap();
        assert_eq!(all.len(), capacity);
        assert!(all.iter().all(|r| r.sequence != 1));
        assert_eq!(all.first().map(|r| r.sequence), Some(2));
        assert_eq!(store.latest().unwrap().map(|r| r.timestamp), Some(2005));
    }

    #[test]
    fn test_batch_filters_by_timestamp_not_position() {
        let store = FixStore::<NoopRawMutex>::new(8);
        // Boot-relative stamps, GPS time, then a stale boot-relative stamp.
        for ts in [50, 60, 1_700_000_000, 70, 1_700_000_030] {
            store.push(fix(ts)).unwrap();
        }

        let batch = store.batch_after(10, 65).unwrap();
        let stamps: Vec<u32> = batch.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, [1_700_000_000, 70, 1_700_000_030]);

        let sequences: Vec<u32> = batch.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, [3, 4, 5]);
    }

    #[test]
    fn test_batch_is_bounded_by_max_count() {
        let store = FixStore::<NoopRawMutex>::new(100);
        for i in 0..80 {
            store.push(fix(3000 + i)).unwrap();
        }

        let batch = store.batch_after(60, 0).unwrap();
        assert_eq!(batch.len(), 60);
        assert_eq!(batch[0].timestamp, 3000);
        assert!(batch.windows(2).all(|w| w[0].sequence < w[1].sequence));

        assert!(store.batch_after(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_batch_wraps_around_ring() {
        let store = FixStore::<NoopRawMutex>::new(4);
        for i in 0..7 {
            store.push(fix(100 + i)).unwrap();
        }

        let batch = store.batch_after(10, 0).unwrap();
        let stamps: Vec<u32> = batch.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, [103, 104, 105, 106]);
    }

    #[test]
    fn test_watermark_only_rises() {
        let store = FixStore::<NoopRawMutex>::new(4);
        assert_eq!(store.set_acked_watermark(500), Ok(true));
        assert_eq!(store.set_acked_watermark(400), Ok(false));
        assert_eq!(store.acked_watermark(), Ok(500));
        assert_eq!(store.set_acked_watermark(500), Ok(false));
        assert_eq!(store.set_acked_watermark(501), Ok(true));
        assert_eq!(store.acked_watermark(), Ok(501));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let store = FixStore::<NoopRawMutex>::new(0);
        assert_eq!(store.capacity(), Ok(1));
        store.push(fix(1)).unwrap();
        store.push(fix(2)).unwrap();
        assert_eq!(store.len(), Ok(1));
        assert_eq!(store.latest().unwrap().map(|r| r.timestamp), Some(2));
    }

    #[test]
    fn test_reentrant_access_reports_busy() {
        let store = FixStore::<NoopRawMutex>::new(4);
        let nested = store.with_ring(|_| store.push(fix(1)));
        assert_eq!(nested, Ok(Err(StoreError::Busy)));
    }
}
