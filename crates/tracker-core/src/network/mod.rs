//! WiFi network selection and upload admission
//!
//! [`NetworkArbitrator`] owns the WiFi driver and decides which known network
//! to associate with. Everything other tasks may observe lives in
//! [`SharedNetwork`], behind its own lock, separate from the fix store lock.

mod arbitrator;
mod state;

pub use arbitrator::*;
pub use state::*;

use core::net::Ipv4Addr;
use core::str::FromStr;

/// Maximum SSID length in bytes (802.11)
pub const SSID_MAX_LEN: usize = 32;

/// Maximum number of scan results kept per scan
pub const MAX_SCAN_RESULTS: usize = 32;

pub type Ssid = heapless::String<SSID_MAX_LEN>;

pub type ScanResults = heapless::Vec<Ssid, MAX_SCAN_RESULTS>;

/// Builds an [`Ssid`], truncating at a char boundary if the input is too long.
pub fn ssid(value: &str) -> Ssid {
    let mut end = value.len().min(SSID_MAX_LEN);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    Ssid::from_str(&value[..end]).unwrap_or_default()
}

/// Which known network the station is associated with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveNetwork {
    #[default]
    None,
    /// Index into the priority list, 0 being the most preferred
    Preferred(usize),
}

/// Result of polling an asynchronous scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPoll {
    /// Still scanning, try again later
    Running,
    Failed,
    Complete(ScanResults),
}

/// Station link as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Down,
    /// Associated and holding an address
    Up { ssid: Ssid, address: Ipv4Addr },
}

/// Non-blocking WiFi station driver.
///
/// None of these calls may wait for the radio: scans are started and then
/// polled, association is started and then observed through [`Self::link`].
pub trait WifiDriver {
    type Error: core::fmt::Debug;

    fn start_scan(&mut self) -> Result<(), Self::Error>;

    fn poll_scan(&mut self) -> ScanPoll;

    /// Begin associating with `ssid`, dropping any current association.
    fn connect(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error>;

    /// Drop the station association. A local access point stays up.
    fn disconnect(&mut self) -> Result<(), Self::Error>;

    fn link(&self) -> LinkStatus;

    /// Address of the local fallback access point, if one is running
    fn access_point_address(&self) -> Option<Ipv4Addr> {
        None
    }
}
