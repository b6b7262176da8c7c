//! Keeps the WiFi station and the LoRa radio from running at the same time

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Instant;
use log::info;

use crate::network::SharedNetwork;
use crate::uplink::lora::{LoraError, LoraOutcome, LoraRadio, LoraUplink};

/// Edge detector on WiFi connectivity that parks and revives the LoRa
/// pipeline.
///
/// Call [`Self::tick`] in place of [`LoraUplink::update`] on every LoRa task
/// tick. While the station is associated LoRa is not evaluated at all.
#[derive(Debug, Default)]
pub struct RadioPowerArbiter {
    wifi_was_connected: bool,
}

impl RadioPowerArbiter {
    pub const fn new() -> Self {
        Self {
            wifi_was_connected: false,
        }
    }

    pub async fn tick<M: RawMutex, R: LoraRadio>(
        &mut self,
        network: &SharedNetwork<M>,
        lora: &mut LoraUplink<'_, M, R>,
        now: Instant,
        speed_kmh: f32,
    ) -> Result<LoraOutcome, LoraError<R::Error>> {
        let connected = network.is_connected();
        let was_connected = core::mem::replace(&mut self.wifi_was_connected, connected);

        match (was_connected, connected) {
            (false, true) => {
                info!("WiFi connected, parking LoRa");
                lora.suspend().await;
                Ok(LoraOutcome::Suppressed)
            }
            (true, true) => Ok(LoraOutcome::Suppressed),
            (true, false) => {
                info!("WiFi lost, reviving LoRa");
                lora.resume().await;
                Ok(LoraOutcome::Resumed)
            }
            (false, false) => lora.update(now, speed_kmh).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoraCredentials, Timings};
    use crate::metrics::{Channel, TxStats};
    use crate::storage::FixStore;
    use crate::uplink::lora::{Downlink, JoinState};
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    #[derive(Default)]
    struct CountingRadio {
        joins: u32,
        sleeps: u32,
        wakes: u32,
    }

    impl LoraRadio for CountingRadio {
        type Error = ();

        async fn join(&mut self, _credentials: &LoraCredentials) -> Result<(), ()> {
            self.joins += 1;
            Ok(())
        }

        async fn sleep(&mut self) -> Result<(), ()> {
            self.sleeps += 1;
            Ok(())
        }

        async fn wake(&mut self) -> Result<(), ()> {
            self.wakes += 1;
            Ok(())
        }

        async fn send_receive(&mut self, _fport: u8, _payload: &[u8]) -> Result<Option<Downlink>, ()> {
            Ok(None)
        }
    }

    #[test]
    fn test_edges_park_and_revive_lora() {
        let store = FixStore::<NoopRawMutex>::new(4);
        let stats = TxStats::new(Channel::Lora);
        let network = SharedNetwork::<NoopRawMutex>::new();
        let mut lora = LoraUplink::new(
            CountingRadio::default(),
            &store,
            &stats,
            LoraCredentials::default(),
            &Timings::default(),
            Instant::from_secs(0),
        );
        let mut arbiter = RadioPowerArbiter::new();
        let mut tick = |t: u64| block_on(arbiter.tick(&network, &mut lora, Instant::from_secs(t), 0.0));

        assert_eq!(tick(0), Ok(LoraOutcome::Joined));

        network.update(|state| state.connected = true);
        assert_eq!(tick(1), Ok(LoraOutcome::Suppressed));
        assert_eq!(tick(2), Ok(LoraOutcome::Suppressed));

        network.update(|state| state.connected = false);
        assert_eq!(tick(3), Ok(LoraOutcome::Resumed));
        assert_eq!(tick(4), Ok(LoraOutcome::Joined));
        drop(tick);

        assert_eq!(lora.join_state(), JoinState::Joined);
        assert_eq!(lora.radio().sleeps, 1);
        assert_eq!(lora.radio().wakes, 1);
        assert_eq!(lora.radio().joins, 2);
    }

    #[test]
    fn test_suspend_drops_session() {
        let store = FixStore::<NoopRawMutex>::new(4);
        let stats = TxStats::new(Channel::Lora);
        let network = SharedNetwork::<NoopRawMutex>::new();
        let mut lora = LoraUplink::new(
            CountingRadio::default(),
            &store,
            &stats,
            LoraCredentials::default(),
            &Timings::default(),
            Instant::from_secs(0),
        );
        let mut arbiter = RadioPowerArbiter::new();

        block_on(arbiter.tick(&network, &mut lora, Instant::from_secs(0), 0.0)).unwrap();
        network.update(|state| state.connected = true);
        block_on(arbiter.tick(&network, &mut lora, Instant::from_secs(5), 0.0)).unwrap();

        assert_eq!(lora.join_state(), JoinState::NotJoined);
    }
}
