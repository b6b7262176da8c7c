use libm::{atan2, cos, sin, sqrt};

use crate::storage::FixRecord;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two E7 positions (Haversine).
pub fn distance_m(lat1_e7: i32, lon1_e7: i32, lat2_e7: i32, lon2_e7: i32) -> f64 {
    const E7_TO_RAD: f64 = core::f64::consts::PI / 180.0 / 1e7;

    let lat1 = lat1_e7 as f64 * E7_TO_RAD;
    let lat2 = lat2_e7 as f64 * E7_TO_RAD;
    let delta_lat = (lat2_e7 as f64 - lat1_e7 as f64) * E7_TO_RAD;
    let delta_lon = (lon2_e7 as f64 - lon1_e7 as f64) * E7_TO_RAD;

    let sin_dlat = sin(delta_lat / 2.0);
    let sin_dlon = sin(delta_lon / 2.0);
    let a = sin_dlat * sin_dlat + cos(lat1) * cos(lat2) * sin_dlon * sin_dlon;
    let c = 2.0 * atan2(sqrt(a), sqrt(1.0 - a));

    EARTH_RADIUS_M * c
}

/// Position a LoRa payload was last sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub latitude_e7: i32,
    pub longitude_e7: i32,
}

impl Position {
    pub fn distance_to(&self, other: &Position) -> f64 {
        distance_m(
            self.latitude_e7,
            self.longitude_e7,
            other.latitude_e7,
            other.longitude_e7,
        )
    }
}

impl From<&FixRecord> for Position {
    fn from(record: &FixRecord) -> Self {
        Self {
            latitude_e7: record.latitude_e7,
            longitude_e7: record.longitude_e7,
        }
    }
}

/// Moving/stationary classification with hysteresis.
///
/// Speeds between the two thresholds keep the current state, so GPS speed
/// jitter around a single threshold cannot flap the movement flag.
#[derive(Debug, Clone, Copy)]
pub struct MotionDetector {
    start_kmh: f32,
    stop_kmh: f32,
    moving: bool,
    /// State as of the last movement-change transmission
    reported: bool,
}

impl MotionDetector {
    pub const fn new(start_kmh: f32, stop_kmh: f32) -> Self {
        Self {
            start_kmh,
            stop_kmh,
            moving: false,
            reported: false,
        }
    }

    /// Feeds the current speed and returns the updated moving flag.
    pub fn update(&mut self, speed_kmh: f32) -> bool {
        if !self.moving && speed_kmh >= self.start_kmh {
            self.moving = true;
        } else if self.moving && speed_kmh <= self.stop_kmh {
            self.moving = false;
        }
        self.moving
    }

    pub fn is_moving(&self) -> bool {
        self.moving
    }

    /// Whether the state differs from the one last reported.
    pub fn changed(&self) -> bool {
        self.moving != self.reported
    }

    /// Records that the current state has been transmitted.
    pub fn mark_reported(&mut self) {
        self.reported = self.moving;
    }
}
