use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant};
use log::{debug, info, warn};

use super::{ActiveNetwork, LinkStatus, ScanPoll, ScanResults, SharedNetwork, Ssid, WifiDriver};
use crate::config::NetworkCredentials;
use crate::timing::Cadence;

const REASON_UPLOADS: &str = "waiting: active uploads";
const REASON_BACKOFF: &str = "waiting: reconnect backoff";
const REASON_ASSOCIATING: &str = "associating";

/// Progress of a network switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchPhase {
    Idle,
    /// Gate closed, waiting for in-flight uploads to finish
    Draining { target: usize },
    /// Association with the target has been started
    Associating { target: usize },
}

impl SwitchPhase {
    fn target(self) -> Option<usize> {
        match self {
            Self::Idle => None,
            Self::Draining { target } | Self::Associating { target } => Some(target),
        }
    }
}

/// What one arbitration cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationStep {
    /// Poll interval has not elapsed
    Idle,
    ScanStarted,
    /// Scan still outstanding; nothing else was done
    Scanning,
    ScanFailed,
    /// Scan results were applied
    Evaluated,
}

/// Keeps the station on the most preferred visible network.
///
/// A switch away from a working association is graceful: the upload gate is
/// closed first and the actual reconnect waits until every admitted upload has
/// released its permit. Scanning never blocks; a scan is started on one cycle
/// and its results are collected on a later one.
pub struct NetworkArbitrator<'a, M: RawMutex, W: WifiDriver> {
    driver: W,
    /// Highest priority first
    networks: &'a [NetworkCredentials<'a>],
    shared: &'a SharedNetwork<M>,
    poll: Cadence,
    reconnect_backoff: Duration,
    last_connect: Option<Instant>,
    scan_in_progress: bool,
    phase: SwitchPhase,
}

impl<'a, M: RawMutex, W: WifiDriver> NetworkArbitrator<'a, M, W> {
    pub fn new(
        driver: W,
        networks: &'a [NetworkCredentials<'a>],
        shared: &'a SharedNetwork<M>,
        poll_interval: Duration,
        reconnect_backoff: Duration,
    ) -> Self {
        Self {
            driver,
            networks,
            shared,
            poll: Cadence::new(poll_interval),
            reconnect_backoff,
            last_connect: None,
            scan_in_progress: false,
            phase: SwitchPhase::Idle,
        }
    }

    pub fn driver(&self) -> &W {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut W {
        &mut self.driver
    }

    /// Runs one arbitration cycle if the poll interval has elapsed.
    pub fn update(&mut self, now: Instant) -> ArbitrationStep {
        if !self.poll.poll(now) {
            return ArbitrationStep::Idle;
        }
        self.cycle(now)
    }

    /// Runs one arbitration cycle unconditionally.
    pub fn cycle(&mut self, now: Instant) -> ArbitrationStep {
        self.refresh_link();
        self.perform_switch_if_safe(now);

        if !self.scan_in_progress {
            return match self.driver.start_scan() {
                Ok(()) => {
                    self.scan_in_progress = true;
                    ArbitrationStep::ScanStarted
                }
                Err(e) => {
                    warn!("WiFi scan could not be started: {:?}", e);
                    ArbitrationStep::ScanFailed
                }
            };
        }

        match self.driver.poll_scan() {
            ScanPoll::Running => ArbitrationStep::Scanning,
            ScanPoll::Failed => {
                warn!("WiFi scan failed, retrying next cycle");
                self.scan_in_progress = false;
                ArbitrationStep::ScanFailed
            }
            ScanPoll::Complete(results) => {
                self.scan_in_progress = false;
                self.evaluate(&results, now);
                self.refresh_link();
                ArbitrationStep::Evaluated
            }
        }
    }

    fn priority_of(&self, ssid: &str) -> Option<usize> {
        self.networks.iter().position(|n| n.ssid == ssid)
    }

    fn best_visible(&self, results: &ScanResults) -> Option<usize> {
        self.networks
            .iter()
            .position(|n| results.iter().any(|seen| seen.as_str() == n.ssid))
    }

    /// Mirrors the driver's link into the shared state.
    fn refresh_link(&mut self) {
        let link = self.driver.link();
        let access_point = self.driver.access_point_address();

        match link {
            LinkStatus::Up { ssid, address } => {
                let active = match self.priority_of(&ssid) {
                    Some(priority) => ActiveNetwork::Preferred(priority),
                    None => ActiveNetwork::None,
                };

                let reached_target = matches!(
                    (self.phase, active),
                    (SwitchPhase::Associating { target }, ActiveNetwork::Preferred(p)) if p == target
                );
                if reached_target {
                    info!("Switched to '{}' ({})", ssid, address);
                    self.phase = SwitchPhase::Idle;
                }

                let phase_idle = self.phase == SwitchPhase::Idle;
                self.shared.update(|state| {
                    let new_association =
                        !state.connected || state.ssid != ssid || state.station_address != Some(address);
                    if new_association {
                        debug!("Station up on '{}' with {}", ssid, address);
                    }

                    state.connected = true;
                    state.active = active;
                    state.ssid = ssid;
                    state.station_address = Some(address);
                    state.access_point_address = access_point;

                    // Address acquired: uploads may flow again unless a
                    // switch is still underway.
                    if phase_idle && (new_association || reached_target) {
                        state.accept_uploads = true;
                    }
                    if phase_idle {
                        state.switch_requested = false;
                        state.switch_target = None;
                        state.reason.clear();
                    }
                });
            }
            LinkStatus::Down => {
                let phase_idle = self.phase == SwitchPhase::Idle;
                self.shared.update(|state| {
                    if state.connected {
                        debug!("Station link down (was '{}')", state.ssid);
                    }
                    state.connected = false;
                    state.active = ActiveNetwork::None;
                    state.ssid = Ssid::new();
                    state.station_address = None;
                    state.access_point_address = access_point;
                    // The local access point keeps accepting uploads.
                    if phase_idle {
                        state.accept_uploads = true;
                    }
                });
            }
        }
    }

    fn evaluate(&mut self, results: &ScanResults, now: Instant) {
        let current = self.shared.snapshot().active;

        match self.best_visible(results) {
            None => self.drop_station(),
            Some(best) if current == ActiveNetwork::Preferred(best) => {
                if let Some(target) = self.phase.target() {
                    info!(
                        "Switch to '{}' cancelled, staying on '{}'",
                        self.networks[target].ssid, self.networks[best].ssid
                    );
                }
                self.phase = SwitchPhase::Idle;
                self.shared.update(|state| {
                    state.switch_requested = false;
                    state.switch_target = None;
                    state.accept_uploads = true;
                    state.reason.clear();
                });
            }
            Some(best) => {
                if self.phase.target() != Some(best) {
                    self.request_switch(best);
                }
                self.perform_switch_if_safe(now);
            }
        }
    }

    /// Closes the upload gate and schedules a switch to `target`.
    fn request_switch(&mut self, target: usize) {
        if let Some(previous) = self.phase.target() {
            info!(
                "Switch to '{}' cancelled, '{}' is no longer the best visible network",
                self.networks[previous].ssid, self.networks[target].ssid
            );
        }
        info!("Switch to '{}' requested", self.networks[target].ssid);

        self.phase = SwitchPhase::Draining { target };
        self.shared.update(|state| {
            state.switch_requested = true;
            state.switch_target = Some(target);
            state.accept_uploads = false;
        });
    }

    fn perform_switch_if_safe(&mut self, now: Instant) {
        let target = match self.phase {
            SwitchPhase::Idle => return,
            SwitchPhase::Draining { target } => {
                let active_uploads = self.shared.active_uploads();
                if active_uploads > 0 {
                    debug!("Switch deferred, {} uploads in flight", active_uploads);
                    self.shared.update(|state| state.set_reason(REASON_UPLOADS));
                    return;
                }
                target
            }
            SwitchPhase::Associating { target } => {
                if self.shared.snapshot().active == ActiveNetwork::Preferred(target) {
                    return;
                }
                target
            }
        };

        if self.connect_to(target, now) {
            self.phase = SwitchPhase::Associating { target };
            self.shared.update(|state| state.set_reason(REASON_ASSOCIATING));
        }
    }

    /// Starts associating with `target`. Returns whether an attempt was made.
    fn connect_to(&mut self, target: usize, now: Instant) -> bool {
        if let Some(last) = self.last_connect {
            if now.saturating_duration_since(last) < self.reconnect_backoff {
                self.shared.update(|state| state.set_reason(REASON_BACKOFF));
                return false;
            }
        }
        self.last_connect = Some(now);

        let credentials = self.networks[target];
        info!("Connecting to '{}'", credentials.ssid);
        match self.driver.connect(credentials.ssid, credentials.password) {
            Ok(()) => true,
            Err(e) => {
                warn!("Connecting to '{}' failed: {:?}", credentials.ssid, e);
                false
            }
        }
    }

    /// No known network in range: drop the station, keep the access point.
    fn drop_station(&mut self) {
        if let Some(target) = self.phase.target() {
            info!("Switch to '{}' cancelled, network out of range", self.networks[target].ssid);
        }
        let associating = matches!(self.phase, SwitchPhase::Associating { .. });
        self.phase = SwitchPhase::Idle;

        if self.shared.is_connected() || associating {
            info!("No known network visible, dropping station association");
            if let Err(e) = self.driver.disconnect() {
                warn!("WiFi disconnect failed: {:?}", e);
            }
        }

        self.shared.update(|state| {
            state.switch_requested = false;
            state.switch_target = None;
            state.accept_uploads = true;
            state.reason.clear();
        });
    }
}
