//! Movement-triggered LoRaWAN uplink
//!
//! Only the latest fix is ever sent, and only when something worth reporting
//! happened: the device started or stopped moving, moved far enough while
//! moving, or has been silent for a heartbeat interval. A minimum send
//! interval caps airtime whatever the trigger.

mod downlink;
mod motion;
pub mod payload;

pub use downlink::*;
pub use motion::*;

use core::fmt::Debug;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant};
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::{LoraCredentials, Timings};
use crate::metrics::TxStats;
use crate::storage::{FixStore, StoreError};
use crate::timing::Cadence;

use payload::{POSITION_FPORT, PositionPayload};

/// LoRaWAN end-device stack and radio.
///
/// Every call returns once the protocol exchange is over; timeouts are the
/// stack's own (join accept windows, RX windows).
pub trait LoraRadio {
    type Error: Debug;

    /// OTAA join.
    fn join(
        &mut self,
        credentials: &LoraCredentials,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Puts the radio into its lowest power state.
    fn sleep(&mut self) -> impl Future<Output = Result<(), Self::Error>>;

    /// Brings the radio out of sleep. Radios that wake on the next
    /// transmission need not override this.
    fn wake(&mut self) -> impl Future<Output = Result<(), Self::Error>> {
        async { Ok(()) }
    }

    /// Unconfirmed uplink followed by the receive windows.
    fn send_receive(
        &mut self,
        fport: u8,
        payload: &[u8],
    ) -> impl Future<Output = Result<Option<Downlink>, Self::Error>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    NotJoined,
    Joined,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoraError<E: Debug> {
    #[error("fix store: {0}")]
    Store(StoreError),
    #[error("join failed: {0:?}")]
    Join(E),
    #[error("radio error: {0:?}")]
    Radio(E),
}

impl<E: Debug> From<StoreError> for LoraError<E> {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Why a payload was sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReasons {
    pub movement_changed: bool,
    pub heartbeat: bool,
    pub distance: bool,
}

impl SendReasons {
    pub fn any(&self) -> bool {
        self.movement_changed || self.heartbeat || self.distance
    }
}

/// What one LoRa tick did when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraOutcome {
    /// WiFi is connected, LoRa is parked
    Suppressed,
    /// Radio was just woken after WiFi went away
    Resumed,
    /// Not joined and the join retry interval has not elapsed
    JoinPending,
    Joined,
    /// Minimum send interval has not elapsed
    RateLimited,
    /// No stored fix, or the latest one is not plausible
    NoValidFix,
    NoTrigger,
    Sent(SendReasons),
}

/// LoRaWAN uplink pipeline state.
pub struct LoraUplink<'a, M: RawMutex, R: LoraRadio> {
    radio: R,
    store: &'a FixStore<M>,
    stats: &'a TxStats,
    credentials: LoraCredentials,
    join_state: JoinState,
    join_retry: Cadence,
    min_send_interval: Duration,
    heartbeat_interval: Duration,
    distance_trigger_m: f64,
    motion: MotionDetector,
    last_send: Instant,
    last_heartbeat: Instant,
    last_sent_position: Option<Position>,
    network_status: NetworkStatus,
}

impl<'a, M: RawMutex, R: LoraRadio> LoraUplink<'a, M, R> {
    /// Boot time counts as the last send and heartbeat, so the first
    /// heartbeat goes out one interval after boot.
    pub fn new(
        radio: R,
        store: &'a FixStore<M>,
        stats: &'a TxStats,
        credentials: LoraCredentials,
        timings: &Timings,
        boot: Instant,
    ) -> Self {
        Self {
            radio,
            store,
            stats,
            credentials,
            join_state: JoinState::NotJoined,
            join_retry: Cadence::new(timings.join_retry()),
            min_send_interval: timings.min_send_interval(),
            heartbeat_interval: timings.heartbeat_interval(),
            distance_trigger_m: timings.distance_trigger_m as f64,
            motion: MotionDetector::new(timings.move_start_kmh, timings.move_stop_kmh),
            last_send: boot,
            last_heartbeat: boot,
            last_sent_position: None,
            network_status: NetworkStatus::default(),
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn join_state(&self) -> JoinState {
        self.join_state
    }

    pub fn is_moving(&self) -> bool {
        self.motion.is_moving()
    }

    /// Network status from the most recent downlinks
    pub fn network_status(&self) -> &NetworkStatus {
        &self.network_status
    }

    /// Forgets the session; the next tick attempts a fresh join.
    pub fn reset_join(&mut self) {
        self.join_state = JoinState::NotJoined;
        self.join_retry.reset();
    }

    /// Puts the radio to sleep and drops the session.
    pub async fn suspend(&mut self) {
        if let Err(e) = self.radio.sleep().await {
            warn!("LoRa radio sleep failed: {:?}", e);
        }
        self.join_state = JoinState::NotJoined;
        info!("LoRa radio sleeping");
    }

    /// Wakes the radio; a rejoin follows on the next tick.
    pub async fn resume(&mut self) {
        if let Err(e) = self.radio.wake().await {
            warn!("LoRa radio wake failed: {:?}", e);
        }
        self.reset_join();
        info!("LoRa radio resumed, rejoin pending");
    }

    /// One pipeline tick. `speed_kmh` is the current GPS ground speed, 0 when
    /// unknown.
    pub async fn update(
        &mut self,
        now: Instant,
        speed_kmh: f32,
    ) -> Result<LoraOutcome, LoraError<R::Error>> {
        match self.join_state {
            JoinState::NotJoined => self.try_join(now).await,
            JoinState::Joined => self.check_and_send(now, speed_kmh).await,
        }
    }

    async fn try_join(&mut self, now: Instant) -> Result<LoraOutcome, LoraError<R::Error>> {
        if !self.join_retry.poll(now) {
            return Ok(LoraOutcome::JoinPending);
        }

        info!(
            "Joining LoRaWAN network, DevEUI {:016X}",
            self.credentials.dev_eui_u64()
        );
        match self.radio.join(&self.credentials).await {
            Ok(()) => {
                info!("LoRaWAN join accepted");
                self.join_state = JoinState::Joined;
                Ok(LoraOutcome::Joined)
            }
            Err(e) => {
                warn!("LoRaWAN join failed, retrying: {:?}", e);
                Err(LoraError::Join(e))
            }
        }
    }

    async fn check_and_send(
        &mut self,
        now: Instant,
        speed_kmh: f32,
    ) -> Result<LoraOutcome, LoraError<R::Error>> {
        if now.saturating_duration_since(self.last_send) < self.min_send_interval {
            return Ok(LoraOutcome::RateLimited);
        }

        let latest = match self.store.latest()? {
            Some(record) if record.is_plausible() => record,
            _ => return Ok(LoraOutcome::NoValidFix),
        };

        let moving = self.motion.update(speed_kmh);
        let position = Position::from(&latest);
        let reasons = SendReasons {
            movement_changed: self.motion.changed(),
            heartbeat: now.saturating_duration_since(self.last_heartbeat)
                >= self.heartbeat_interval,
            distance: moving
                && self
                    .last_sent_position
                    .is_some_and(|last| last.distance_to(&position) >= self.distance_trigger_m),
        };
        if !reasons.any() {
            return Ok(LoraOutcome::NoTrigger);
        }

        let payload = PositionPayload::from(&latest).encode();
        debug!(
            "LoRa send seq={} ts={} reasons={:?} payload={:02X?}",
            latest.sequence, latest.timestamp, reasons, payload
        );

        let result = {
            let _in_flight = self.stats.begin_transmission();
            self.radio.send_receive(POSITION_FPORT, &payload).await
        };
        // A failed attempt still spends airtime.
        self.last_send = now;
        let downlink = result.map_err(|e| {
            warn!("LoRa send failed: {:?}", e);
            LoraError::Radio(e)
        })?;

        self.stats.record(now, 1);
        if reasons.movement_changed {
            self.last_sent_position = Some(position);
            self.motion.mark_reported();
        }
        if reasons.heartbeat {
            self.last_heartbeat = now;
        }
        if let Some(downlink) = downlink {
            self.network_status.apply(&downlink);
        }

        info!(
            "LoRa position sent (moving={}, reasons={:?})",
            moving, reasons
        );
        Ok(LoraOutcome::Sent(reasons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Channel;
    use crate::storage::{FixFlags, FixRecord};
    use alloc::vec::Vec;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    #[derive(Default)]
    struct MockRadio {
        fail_joins: u32,
        fail_sends: bool,
        joins: u32,
        sleeps: u32,
        wakes: u32,
        sent: Vec<(u8, Vec<u8>)>,
        downlink: Option<Downlink>,
    }

    impl LoraRadio for MockRadio {
        type Error = &'static str;

        async fn join(&mut self, _credentials: &LoraCredentials) -> Result<(), Self::Error> {
            self.joins += 1;
            if self.fail_joins > 0 {
                self.fail_joins -= 1;
                return Err("no join accept");
            }
            Ok(())
        }

        async fn sleep(&mut self) -> Result<(), Self::Error> {
            self.sleeps += 1;
            Ok(())
        }

        async fn wake(&mut self) -> Result<(), Self::Error> {
            self.wakes += 1;
            Ok(())
        }

        async fn send_receive(
            &mut self,
            fport: u8,
            payload: &[u8],
        ) -> Result<Option<Downlink>, Self::Error> {
            self.sent.push((fport, payload.to_vec()));
            if self.fail_sends {
                return Err("tx timeout");
            }
            Ok(self.downlink.take())
        }
    }

    const PARIS: (i32, i32) = (488_566_000, 23_522_000);

    fn store_with_fix(timestamp: u32) -> FixStore<NoopRawMutex> {
        let store = FixStore::new(8);
        store
            .push(FixRecord::new(timestamp, PARIS.0, PARIS.1, 77, FixFlags::GPS_VALID))
            .unwrap();
        store
    }

    fn joined<'a>(
        store: &'a FixStore<NoopRawMutex>,
        stats: &'a TxStats,
    ) -> LoraUplink<'a, NoopRawMutex, MockRadio> {
        let mut uplink = LoraUplink::new(
            MockRadio::default(),
            store,
            stats,
            LoraCredentials::default(),
            &Timings::default(),
            Instant::from_secs(0),
        );
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(0), 0.0)),
            Ok(LoraOutcome::Joined)
        );
        uplink
    }

    #[test]
    fn test_join_retries_at_fixed_interval() {
        let store = store_with_fix(1_700_000_000);
        let stats = TxStats::new(Channel::Lora);
        let radio = MockRadio {
            fail_joins: 2,
            ..Default::default()
        };
        let mut uplink = LoraUplink::new(
            radio,
            &store,
            &stats,
            LoraCredentials::default(),
            &Timings::default(),
            Instant::from_secs(0),
        );

        assert_eq!(
            block_on(uplink.update(Instant::from_secs(0), 0.0)),
            Err(LoraError::Join("no join accept"))
        );
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(5), 0.0)),
            Ok(LoraOutcome::JoinPending)
        );
        assert!(block_on(uplink.update(Instant::from_secs(10), 0.0)).is_err());
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(20), 0.0)),
            Ok(LoraOutcome::Joined)
        );
        assert_eq!(uplink.radio().joins, 3);
        assert_eq!(uplink.join_state(), JoinState::Joined);
        assert!(uplink.radio().sent.is_empty());
    }

    #[test]
    fn test_stationary_device_sends_one_heartbeat() {
        let store = store_with_fix(1_700_000_000);
        let stats = TxStats::new(Channel::Lora);
        let mut uplink = joined(&store, &stats);

        let mut sent_at = Vec::new();
        for t in (10..1800).step_by(10) {
            let now = Instant::from_secs(t);
            if let Ok(LoraOutcome::Sent(reasons)) = block_on(uplink.update(now, 0.0)) {
                assert!(reasons.heartbeat);
                assert!(!reasons.movement_changed && !reasons.distance);
                sent_at.push(t);
            }
        }

        assert_eq!(sent_at, [900]);
        assert_eq!(stats.count(), 1);
        let (fport, payload) = &uplink.radio().sent[0];
        assert_eq!(*fport, POSITION_FPORT);
        assert_eq!(payload.len(), payload::PAYLOAD_LEN);
    }

    #[test]
    fn test_failed_send_waits_min_interval() {
        let store = store_with_fix(1_700_000_000);
        let stats = TxStats::new(Channel::Lora);
        let mut uplink = joined(&store, &stats);
        uplink.radio_mut().fail_sends = true;

        assert_eq!(
            block_on(uplink.update(Instant::from_secs(900), 0.0)),
            Err(LoraError::Radio("tx timeout"))
        );
        for t in 901..910 {
            assert_eq!(
                block_on(uplink.update(Instant::from_secs(t), 0.0)),
                Ok(LoraOutcome::RateLimited)
            );
        }
        assert_eq!(uplink.radio().sent.len(), 1);
        assert_eq!(stats.count(), 0);

        // The heartbeat is still owed once the interval has passed.
        uplink.radio_mut().fail_sends = false;
        let outcome = block_on(uplink.update(Instant::from_secs(1050), 0.0));
        assert!(matches!(outcome, Ok(LoraOutcome::Sent(reasons)) if reasons.heartbeat));
        assert_eq!(uplink.radio().sent.len(), 2);
    }

    #[test]
    fn test_movement_start_respects_rate_limit() {
        let store = store_with_fix(1_700_000_000);
        let stats = TxStats::new(Channel::Lora);
        let mut uplink = joined(&store, &stats);

        assert_eq!(
            block_on(uplink.update(Instant::from_secs(100), 5.0)),
            Ok(LoraOutcome::RateLimited)
        );
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(150), 5.0)),
            Ok(LoraOutcome::Sent(SendReasons {
                movement_changed: true,
                ..Default::default()
            }))
        );
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(200), 5.0)),
            Ok(LoraOutcome::RateLimited)
        );
        // Still moving, same place: nothing new to report.
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(300), 5.0)),
            Ok(LoraOutcome::NoTrigger)
        );
    }

    #[test]
    fn test_distance_trigger_while_moving() {
        let store = store_with_fix(1_700_000_000);
        let stats = TxStats::new(Channel::Lora);
        let mut uplink = joined(&store, &stats);

        block_on(uplink.update(Instant::from_secs(150), 5.0)).unwrap();

        // About 111 m north
        store
            .push(FixRecord::new(1_700_000_300, PARIS.0 + 10_000, PARIS.1, 76, FixFlags::GPS_VALID))
            .unwrap();
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(300), 5.0)),
            Ok(LoraOutcome::Sent(SendReasons {
                distance: true,
                ..Default::default()
            }))
        );
        assert_eq!(stats.count(), 2);
    }

    #[test]
    fn test_implausible_fix_is_skipped() {
        let store = store_with_fix(12_345);
        let stats = TxStats::new(Channel::Lora);
        let mut uplink = joined(&store, &stats);

        assert_eq!(
            block_on(uplink.update(Instant::from_secs(900), 0.0)),
            Ok(LoraOutcome::NoValidFix)
        );

        let empty = FixStore::<NoopRawMutex>::new(4);
        let mut uplink = joined(&empty, &stats);
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(900), 0.0)),
            Ok(LoraOutcome::NoValidFix)
        );
        assert_eq!(stats.count(), 0);
    }

    #[test]
    fn test_downlink_updates_network_status() {
        let store = store_with_fix(1_700_000_000);
        let stats = TxStats::new(Channel::Lora);
        let mut uplink = joined(&store, &stats);
        uplink.radio_mut().downlink = Some(Downlink {
            fport: MAC_FPORT,
            data: heapless::Vec::from_slice(&[0x02, 9, 2]).unwrap(),
        });

        block_on(uplink.update(Instant::from_secs(900), 0.0)).unwrap();
        assert_eq!(
            uplink.network_status().link_check,
            Some(LinkCheck {
                margin_db: 9,
                gateways: 2
            })
        );
    }

    #[test]
    fn test_suspend_and_resume_force_rejoin() {
        let store = store_with_fix(1_700_000_000);
        let stats = TxStats::new(Channel::Lora);
        let mut uplink = joined(&store, &stats);

        block_on(uplink.suspend());
        assert_eq!(uplink.join_state(), JoinState::NotJoined);
        assert_eq!(uplink.radio().sleeps, 1);

        block_on(uplink.resume());
        assert_eq!(uplink.radio().wakes, 1);
        assert_eq!(
            block_on(uplink.update(Instant::from_secs(3), 0.0)),
            Ok(LoraOutcome::Joined)
        );
        assert_eq!(uplink.radio().joins, 2);
    }
}
