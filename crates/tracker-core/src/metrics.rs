//! Transmit statistics for display and diagnostics
//!
//! Each uplink channel owns one [`TxStats`] that it updates after every
//! transmission. The display task only ever reads them, so they are plain
//! atomics shared by reference rather than state behind a lock.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embassy_time::Instant;

/// Uplink channel a statistic belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Wifi,
    Lora,
}

impl Channel {
    /// Get the label used on the wire and in logs
    pub const fn label(self) -> &'static str {
        match self {
            Self::Wifi => "wifi",
            Self::Lora => "lora",
        }
    }
}

/// Per-channel transmit counters.
pub struct TxStats {
    channel: Channel,
    /// Seconds since boot of the last successful transmission
    last_tx_secs: AtomicU32,
    count: AtomicU32,
    in_flight: AtomicBool,
}

impl TxStats {
    pub const fn new(channel: Channel) -> Self {
        Self {
            channel,
            last_tx_secs: AtomicU32::new(0),
            count: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    pub const fn channel(&self) -> Channel {
        self.channel
    }

    /// Records `items` delivered at `now`.
    ///
    /// WiFi counts acknowledged fixes, LoRa counts payloads.
    pub fn record(&self, now: Instant, items: u32) {
        self.last_tx_secs.store(now.as_secs() as u32, Ordering::Relaxed);
        self.count.fetch_add(items, Ordering::Relaxed);
    }

    /// Time of the last transmission, `None` until the first one.
    pub fn last_tx(&self) -> Option<Instant> {
        if self.count() == 0 {
            None
        } else {
            Some(Instant::from_secs(self.last_tx_secs.load(Ordering::Relaxed) as u64))
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether a radio exchange is running right now
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Marks the channel busy until the returned guard is dropped.
    pub fn begin_transmission(&self) -> InFlight<'_> {
        self.in_flight.store(true, Ordering::Release);
        InFlight { flag: &self.in_flight }
    }
}

/// Clears the in-flight flag on drop, on every exit path.
pub struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
