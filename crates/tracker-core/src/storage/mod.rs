//! Fix records and the shared ring buffer they live in.

pub mod fix_store;

pub use fix_store::*;

/// Earliest plausible fix timestamp (2000-01-01T00:00:00Z).
///
/// Anything older is a clock that has not been set yet.
pub const EPOCH_FLOOR_SECS: u32 = 946_684_800;

/// Latitude bound in degrees × 10^7.
pub const LATITUDE_E7_LIMIT: i32 = 900_000_000;

/// Longitude bound in degrees × 10^7.
pub const LONGITUDE_E7_LIMIT: i32 = 1_800_000_000;

/// Default ring capacity: 24 hours of fixes at a 30 s sampling rate.
pub const DEFAULT_CAPACITY: usize = 2880;

/// Bit flags carried by every [`FixRecord`].
///
/// Only `CHARGING`, `GPS_VALID` and `LOW_BATTERY` are set by the sampler; the
/// movement and heartbeat bits are reserved for a higher-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FixFlags(u8);

impl FixFlags {
    pub const CHARGING: Self = Self(1 << 0);
    pub const GPS_VALID: Self = Self(1 << 1);
    pub const MOVE_ACTIVE: Self = Self(1 << 2);
    pub const MOVE_STARTED: Self = Self(1 << 3);
    pub const MOVE_STOPPED: Self = Self(1 << 4);
    pub const HEARTBEAT: Self = Self(1 << 5);
    pub const LOW_BATTERY: Self = Self(1 << 6);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl core::ops::BitOr for FixFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One sampled GPS observation.
///
/// `sequence` is assigned by [`FixStore::push`]; whatever the caller puts
/// there is overwritten. `timestamp` is epoch seconds when GPS time is known,
/// otherwise seconds since boot, so it is only used as the acknowledgment
/// comparison key and never assumed to be monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixRecord {
    pub sequence: u32,
    pub timestamp: u32,
    /// Latitude in degrees × 10^7
    pub latitude_e7: i32,
    /// Longitude in degrees × 10^7
    pub longitude_e7: i32,
    /// Battery charge 0-100, 0 if unknown
    pub battery_percent: u8,
    pub flags: FixFlags,
}

impl FixRecord {
    /// Creates an unsequenced record.
    pub fn new(
        timestamp: u32,
        latitude_e7: i32,
        longitude_e7: i32,
        battery_percent: u8,
        flags: FixFlags,
    ) -> Self {
        Self {
            sequence: 0,
            timestamp,
            latitude_e7,
            longitude_e7,
            battery_percent,
            flags,
        }
    }

    pub fn latitude_deg(&self) -> f64 {
        self.latitude_e7 as f64 / 1e7
    }

    pub fn longitude_deg(&self) -> f64 {
        self.longitude_e7 as f64 / 1e7
    }

    /// Whether the timestamp is past [`EPOCH_FLOOR_SECS`] and both
    /// coordinates are inside their valid ranges.
    pub fn is_plausible(&self) -> bool {
        self.timestamp >= EPOCH_FLOOR_SECS
            && (-LATITUDE_E7_LIMIT..=LATITUDE_E7_LIMIT).contains(&self.latitude_e7)
            && (-LONGITUDE_E7_LIMIT..=LONGITUDE_E7_LIMIT).contains(&self.longitude_e7)
    }
}

/// Converts degrees to the fixed-point E7 representation, rounding to nearest.
pub fn degrees_to_e7(degrees: f64) -> i32 {
    libm::round(degrees * 1e7) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_bits_match_wire_layout() {
        assert_eq!(FixFlags::CHARGING.bits(), 0x01);
        assert_eq!(FixFlags::GPS_VALID.bits(), 0x02);
        assert_eq!(FixFlags::LOW_BATTERY.bits(), 0x40);

        let mut flags = FixFlags::CHARGING | FixFlags::GPS_VALID;
        assert!(flags.contains(FixFlags::GPS_VALID));
        flags.set(FixFlags::CHARGING, false);
        assert_eq!(flags.bits(), 0x02);
    }

    #[test]
    fn test_plausibility_bounds() {
        let good = FixRecord::new(1_700_000_000, 488_566_000, 23_522_000, 77, FixFlags::empty());
        assert!(good.is_plausible());

        let early = FixRecord { timestamp: EPOCH_FLOOR_SECS - 1, ..good };
        assert!(!early.is_plausible());

        let north = FixRecord { latitude_e7: LATITUDE_E7_LIMIT + 1, ..good };
        assert!(!north.is_plausible());

        let west = FixRecord { longitude_e7: -LONGITUDE_E7_LIMIT - 1, ..good };
        assert!(!west.is_plausible());

        let edge = FixRecord {
            latitude_e7: -LATITUDE_E7_LIMIT,
            longitude_e7: LONGITUDE_E7_LIMIT,
            ..good
        };
        assert!(edge.is_plausible());
    }

    #[test]
    fn test_degrees_to_e7_rounds() {
        assert_eq!(degrees_to_e7(48.8566), 488_566_000);
        assert_eq!(degrees_to_e7(-33.8688), -338_688_000);
        assert_eq!(degrees_to_e7(2.3522), 23_522_000);
    }
}
