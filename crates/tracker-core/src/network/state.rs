use core::cell::RefCell;
use core::fmt::Write;
use core::net::Ipv4Addr;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use thiserror_no_std::Error;

use super::{ActiveNetwork, Ssid};

pub type SwitchReason = heapless::String<64>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadRefused {
    #[error("uploads are paused for a network switch")]
    SwitchPending,
}

/// Network state shared between the arbitrator and the uplink tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    /// Station is associated and holds an address
    pub connected: bool,
    pub active: ActiveNetwork,
    pub ssid: Ssid,
    pub station_address: Option<Ipv4Addr>,
    pub access_point_address: Option<Ipv4Addr>,
    pub switch_requested: bool,
    /// Priority index the pending switch is heading for
    pub switch_target: Option<usize>,
    pub active_uploads: u32,
    pub accept_uploads: bool,
    /// Why a pending switch has not happened yet
    pub reason: SwitchReason,
}

impl NetworkState {
    fn new() -> Self {
        Self {
            accept_uploads: true,
            ..Self::default()
        }
    }

    pub(super) fn set_reason(&mut self, reason: &str) {
        self.reason.clear();
        // Reasons are short literals that always fit.
        let _ = self.reason.write_str(reason);
    }
}

/// Lock-guarded handle on the [`NetworkState`].
///
/// Uplinks only see the narrow accessors below plus the upload admission
/// pair [`Self::begin_upload`] / [`UploadPermit`]. All mutation of the
/// association fields goes through the arbitrator.
pub struct SharedNetwork<M: RawMutex> {
    state: Mutex<M, RefCell<NetworkState>>,
}

impl<M: RawMutex> Default for SharedNetwork<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> SharedNetwork<M> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(NetworkState::new())),
        }
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut NetworkState) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    fn read<R>(&self, f: impl FnOnce(&NetworkState) -> R) -> R {
        self.state.lock(|cell| f(&cell.borrow()))
    }

    /// Asks to start an upload.
    ///
    /// Refused while a network switch is pending. On success the in-flight
    /// counter is incremented; dropping the permit decrements it again, so a
    /// pending switch can never be blocked forever by a forgotten release.
    pub fn begin_upload(&self) -> Result<UploadPermit<'_, M>, UploadRefused> {
        self.update(|state| {
            if !state.accept_uploads {
                return Err(UploadRefused::SwitchPending);
            }
            state.active_uploads += 1;
            Ok(())
        })?;
        Ok(UploadPermit { network: self })
    }

    fn end_upload(&self) {
        self.update(|state| {
            state.active_uploads = state.active_uploads.saturating_sub(1);
        });
    }

    pub fn is_connected(&self) -> bool {
        self.read(|state| state.connected)
    }

    pub fn ssid(&self) -> Ssid {
        self.read(|state| state.ssid.clone())
    }

    pub fn station_address(&self) -> Option<Ipv4Addr> {
        self.read(|state| state.station_address)
    }

    pub fn active_uploads(&self) -> u32 {
        self.read(|state| state.active_uploads)
    }

    pub fn accepts_uploads(&self) -> bool {
        self.read(|state| state.accept_uploads)
    }

    pub fn switch_reason(&self) -> SwitchReason {
        self.read(|state| state.reason.clone())
    }

    /// Copy of the whole state for display and diagnostics.
    pub fn snapshot(&self) -> NetworkState {
        self.read(|state| state.clone())
    }
}

/// Proof that an upload was admitted. Ends the upload when dropped.
#[must_use = "dropping the permit ends the upload immediately"]
pub struct UploadPermit<'a, M: RawMutex> {
    network: &'a SharedNetwork<M>,
}

impl<M: RawMutex> UploadPermit<'_, M> {
    /// Ends the upload now. Equivalent to dropping the permit.
    pub fn finish(self) {}
}

impl<M: RawMutex> Drop for UploadPermit<'_, M> {
    fn drop(&mut self) {
        self.network.end_upload();
    }
}
