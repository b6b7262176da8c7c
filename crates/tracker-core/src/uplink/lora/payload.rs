//! 13-byte LoRa position payload
//!
//! | bytes  | field                   |
//! |--------|-------------------------|
//! | 0..4   | timestamp, `u32`        |
//! | 4..8   | latitude × 10^7, `i32`  |
//! | 8..12  | longitude × 10^7, `i32` |
//! | 12     | battery percent, `u8`   |
//!
//! All fields big-endian. The format carries no version byte, so any other
//! length is rejected outright.

use thiserror_no_std::Error;

use crate::storage::{FixRecord, LATITUDE_E7_LIMIT, LONGITUDE_E7_LIMIT};

pub const PAYLOAD_LEN: usize = 13;

/// Application port position payloads are sent on
pub const POSITION_FPORT: u8 = 1;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    #[error("expected 13 bytes, got {0}")]
    WrongLength(usize),
}

/// Suspicious values found by [`decode`]. The payload is still returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadWarning {
    LatitudeOutOfRange(i32),
    LongitudeOutOfRange(i32),
    BatteryOverFull(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionPayload {
    pub timestamp: u32,
    pub latitude_e7: i32,
    pub longitude_e7: i32,
    pub battery_percent: u8,
}

impl PositionPayload {
    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        out[0..4].copy_from_slice(&self.timestamp.to_be_bytes());
        out[4..8].copy_from_slice(&self.latitude_e7.to_be_bytes());
        out[8..12].copy_from_slice(&self.longitude_e7.to_be_bytes());
        out[12] = self.battery_percent;
        out
    }

    pub fn warnings(&self) -> heapless::Vec<PayloadWarning, 3> {
        let mut warnings = heapless::Vec::new();
        // Capacity equals the number of checks, so pushes cannot fail.
        if !(-LATITUDE_E7_LIMIT..=LATITUDE_E7_LIMIT).contains(&self.latitude_e7) {
            let _ = warnings.push(PayloadWarning::LatitudeOutOfRange(self.latitude_e7));
        }
        if !(-LONGITUDE_E7_LIMIT..=LONGITUDE_E7_LIMIT).contains(&self.longitude_e7) {
            let _ = warnings.push(PayloadWarning::LongitudeOutOfRange(self.longitude_e7));
        }
        if self.battery_percent > 100 {
            let _ = warnings.push(PayloadWarning::BatteryOverFull(self.battery_percent));
        }
        warnings
    }
}

impl From<&FixRecord> for PositionPayload {
    fn from(record: &FixRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            latitude_e7: record.latitude_e7,
            longitude_e7: record.longitude_e7,
            battery_percent: record.battery_percent,
        }
    }
}

pub fn encode(record: &FixRecord) -> [u8; PAYLOAD_LEN] {
    PositionPayload::from(record).encode()
}

pub fn decode(bytes: &[u8]) -> Result<PositionPayload, PayloadError> {
    let bytes: &[u8; PAYLOAD_LEN] = bytes
        .try_into()
        .map_err(|_| PayloadError::WrongLength(bytes.len()))?;

    let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
    Ok(PositionPayload {
        timestamp: u32::from_be_bytes(word(0)),
        latitude_e7: i32::from_be_bytes(word(4)),
        longitude_e7: i32::from_be_bytes(word(8)),
        battery_percent: bytes[12],
    })
}
