//! Turning GPS readings into stored fixes

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Instant;
use log::{debug, warn};
use thiserror_no_std::Error;

use crate::storage::{
    EPOCH_FLOOR_SECS, FixFlags, FixRecord, FixStore, LATITUDE_E7_LIMIT, LONGITUDE_E7_LIMIT,
    StoreError, degrees_to_e7,
};

/// Battery level at or below which [`FixFlags::LOW_BATTERY`] is set
pub const LOW_BATTERY_PERCENT: u8 = 15;

/// GPS clock values at or below this are an unset clock
const MIN_GPS_EPOCH: u32 = 100_000;

/// One reading from the GPS receiver and battery monitor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpsSample {
    /// GPS UTC time, if the receiver has decoded it
    pub epoch_secs: Option<u32>,
    pub latitude: f64,
    pub longitude: f64,
    /// Receiver reports a current position fix
    pub location_valid: bool,
    /// Ground speed, if the receiver reports one
    pub speed_kmh: Option<f32>,
    pub battery_percent: u8,
    pub charging: bool,
}

impl GpsSample {
    /// Speed fed to movement detection, 0 when unknown
    pub fn speed_or_zero(&self) -> f32 {
        self.speed_kmh.unwrap_or(0.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleError {
    #[error("timestamp {0} predates 2000-01-01, clock not set")]
    ClockNotSet(u32),
    #[error("coordinates out of range: {0}, {1} (E7)")]
    OutOfRange(i32, i32),
    #[error("coordinates are not finite numbers")]
    NotFinite,
    #[error("fix store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SampleError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// GPS epoch seconds when the receiver clock is set, seconds since boot
/// otherwise.
pub fn sample_timestamp(gps_epoch: Option<u32>, uptime: Instant) -> u32 {
    match gps_epoch {
        Some(epoch) if epoch > MIN_GPS_EPOCH => epoch,
        _ => uptime.as_secs() as u32,
    }
}

/// Builds a validated record from a sample without storing it.
pub fn build_record(sample: &GpsSample, uptime: Instant) -> Result<FixRecord, SampleError> {
    let timestamp = sample_timestamp(sample.epoch_secs, uptime);
    if timestamp < EPOCH_FLOOR_SECS {
        return Err(SampleError::ClockNotSet(timestamp));
    }

    if !sample.latitude.is_finite() || !sample.longitude.is_finite() {
        return Err(SampleError::NotFinite);
    }

    let latitude_e7 = degrees_to_e7(sample.latitude);
    let longitude_e7 = degrees_to_e7(sample.longitude);
    if !(-LATITUDE_E7_LIMIT..=LATITUDE_E7_LIMIT).contains(&latitude_e7)
        || !(-LONGITUDE_E7_LIMIT..=LONGITUDE_E7_LIMIT).contains(&longitude_e7)
    {
        return Err(SampleError::OutOfRange(latitude_e7, longitude_e7));
    }

    let mut flags = FixFlags::empty();
    flags.set(FixFlags::CHARGING, sample.charging);
    flags.set(FixFlags::GPS_VALID, sample.location_valid);
    flags.set(
        FixFlags::LOW_BATTERY,
        sample.battery_percent <= LOW_BATTERY_PERCENT,
    );

    Ok(FixRecord::new(
        timestamp,
        latitude_e7,
        longitude_e7,
        sample.battery_percent,
        flags,
    ))
}

/// Validates a sample and pushes it into the store.
pub fn record_sample<M: RawMutex>(
    store: &FixStore<M>,
    sample: &GpsSample,
    uptime: Instant,
) -> Result<FixRecord, SampleError> {
    let record = match build_record(sample, uptime) {
        Ok(record) => record,
        Err(e) => {
            debug!("Sample rejected: {}", e);
            return Err(e);
        }
    };

    match store.push(record) {
        Ok(stored) => {
            debug!(
                "Stored fix seq={} ts={} lat={:.6} lon={:.6} bat={}% flags=0x{:02x}",
                stored.sequence,
                stored.timestamp,
                stored.latitude_deg(),
                stored.longitude_deg(),
                stored.battery_percent,
                stored.flags.bits()
            );
            Ok(stored)
        }
        Err(e) => {
            warn!("Failed to store fix: {}", e);
            Err(e.into())
        }
    }
}
