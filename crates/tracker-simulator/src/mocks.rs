//! Simulated hardware and backend for the host simulator.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Instant as WallInstant;

use embassy_time::{Duration, Instant};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tracker_core::config::LoraCredentials;
use tracker_core::network::{LinkStatus, ScanPoll, ScanResults, Ssid, WifiDriver, ssid};
use tracker_core::sampler::GpsSample;
use tracker_core::uplink::lora::payload;
use tracker_core::uplink::lora::{Downlink, LoraRadio, MAC_FPORT};
use tracker_core::uplink::wifi::{HttpClient, HttpResponse, TransportError, UploadRequest};

/// Epoch seconds the simulated GPS clock starts from
pub const SIM_EPOCH_START: u32 = 1_700_000_000;

/// Simulated seconds before the GPS receiver has decoded UTC
const GPS_TIME_ACQUIRE_SECS: u64 = 45;

const SCAN_DURATION: Duration = Duration::from_secs(2);
const ASSOCIATION_DELAY: Duration = Duration::from_secs(3);

/// Length of one visibility window per network
const WINDOW_SECS: u64 = 700;
/// Offset between consecutive windows; windows overlap by the difference
const WINDOW_STRIDE_SECS: u64 = 500;
/// Dead zone with no known network at the end of every cycle
const DEAD_ZONE_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall clock accelerated by a constant factor.
pub struct SimClock {
    start: WallInstant,
    scale: f64,
}

impl SimClock {
    pub fn new(scale: f64) -> Self {
        Self {
            start: WallInstant::now(),
            scale,
        }
    }

    pub fn now(&self) -> Instant {
        let sim_secs = self.start.elapsed().as_secs_f64() * self.scale;
        Instant::from_micros((sim_secs * 1e6) as u64)
    }

    /// Real time to sleep for `sim` simulated time
    pub fn real(&self, sim: Duration) -> std::time::Duration {
        std::time::Duration::from_secs_f64(sim.as_micros() as f64 / 1e6 / self.scale)
    }
}

// ---------------------------------------------------------------------------
// GPS
// ---------------------------------------------------------------------------

/// Random walk alternating between resting and walking phases.
pub struct GpsWalker {
    rng: StdRng,
    latitude: f64,
    longitude: f64,
    heading_rad: f64,
    speed_kmh: f32,
    walking: bool,
    phase_left_secs: f64,
    battery: f64,
}

impl GpsWalker {
    pub fn new(seed: u64, latitude: f64, longitude: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            latitude,
            longitude,
            heading_rad: 0.0,
            speed_kmh: 0.0,
            walking: false,
            phase_left_secs: 600.0,
            battery: 100.0,
        }
    }

    /// Advances the walk by `dt_secs` and reads the simulated receiver.
    pub fn advance(&mut self, now: Instant, dt_secs: f64) -> GpsSample {
        self.phase_left_secs -= dt_secs;
        if self.phase_left_secs <= 0.0 {
            self.walking = !self.walking;
            self.phase_left_secs = self.rng.gen_range(300.0..900.0);
            self.heading_rad = self.rng.gen_range(0.0..core::f64::consts::TAU);
            info!(
                "GPS: {} for {:.0} s",
                if self.walking { "walking" } else { "resting" },
                self.phase_left_secs
            );
        }

        self.speed_kmh = if self.walking {
            self.rng.gen_range(3.5..5.5)
        } else {
            // Receiver jitter while standing still
            self.rng.gen_range(0.0..0.8)
        };

        if self.walking {
            let meters = self.speed_kmh as f64 / 3.6 * dt_secs;
            let north = meters * self.heading_rad.cos();
            let east = meters * self.heading_rad.sin();
            self.latitude += north / 111_320.0;
            self.longitude += east / (111_320.0 * self.latitude.to_radians().cos());
        }

        self.battery = (self.battery - dt_secs / 600.0).max(5.0);

        let elapsed = now.as_secs();
        GpsSample {
            epoch_secs: (elapsed >= GPS_TIME_ACQUIRE_SECS).then(|| SIM_EPOCH_START + elapsed as u32),
            latitude: self.latitude,
            longitude: self.longitude,
            location_valid: true,
            speed_kmh: Some(self.speed_kmh),
            battery_percent: self.battery as u8,
            charging: false,
        }
    }
}

// ---------------------------------------------------------------------------
// WiFi
// ---------------------------------------------------------------------------

/// Known networks drifting in and out of range on a fixed cycle.
///
/// The lowest priority network shows up first, the next one overlaps its
/// tail, and so on; every cycle ends with a stretch where none is in range.
pub struct RadioEnvironment {
    /// Highest priority first
    networks: Vec<String>,
}

impl RadioEnvironment {
    pub fn new(networks: Vec<String>) -> Self {
        Self { networks }
    }

    fn cycle_secs(&self) -> u64 {
        WINDOW_STRIDE_SECS * self.networks.len().saturating_sub(1) as u64
            + WINDOW_SECS
            + DEAD_ZONE_SECS
    }

    pub fn is_visible(&self, name: &str, now: Instant) -> bool {
        let count = self.networks.len();
        let Some(priority) = self.networks.iter().position(|n| n == name) else {
            return false;
        };
        let slot = (count - 1 - priority) as u64;
        let t = now.as_secs() % self.cycle_secs();
        let start = slot * WINDOW_STRIDE_SECS;
        (start..start + WINDOW_SECS).contains(&t)
    }

    pub fn visible(&self, now: Instant) -> ScanResults {
        let mut results = ScanResults::new();
        // A couple of foreign networks are always around.
        for name in ["cafe-guest", "eduroam"] {
            let _ = results.push(ssid(name));
        }
        for name in self.networks.iter().filter(|n| self.is_visible(n, now)) {
            let _ = results.push(ssid(name));
        }
        results
    }
}

struct Association {
    ssid: Ssid,
    /// When the station gets its address
    ready_at: Instant,
}

pub struct MockWifi<'a> {
    clock: &'a SimClock,
    environment: &'a RadioEnvironment,
    scan_started: Option<Instant>,
    association: Option<Association>,
}

impl<'a> MockWifi<'a> {
    pub fn new(clock: &'a SimClock, environment: &'a RadioEnvironment) -> Self {
        Self {
            clock,
            environment,
            scan_started: None,
            association: None,
        }
    }
}

impl WifiDriver for MockWifi<'_> {
    type Error = &'static str;

    fn start_scan(&mut self) -> Result<(), Self::Error> {
        if self.scan_started.is_some() {
            return Err("scan already running");
        }
        self.scan_started = Some(self.clock.now());
        Ok(())
    }

    fn poll_scan(&mut self) -> ScanPoll {
        let now = self.clock.now();
        match self.scan_started {
            None => ScanPoll::Failed,
            Some(started) if now.saturating_duration_since(started) < SCAN_DURATION => {
                ScanPoll::Running
            }
            Some(_) => {
                self.scan_started = None;
                ScanPoll::Complete(self.environment.visible(now))
            }
        }
    }

    fn connect(&mut self, ssid_name: &str, _password: &str) -> Result<(), Self::Error> {
        let now = self.clock.now();
        if !self.environment.is_visible(ssid_name, now) {
            return Err("network not in range");
        }
        self.association = Some(Association {
            ssid: ssid(ssid_name),
            ready_at: now + ASSOCIATION_DELAY,
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.association = None;
        Ok(())
    }

    fn link(&self) -> LinkStatus {
        let now = self.clock.now();
        match &self.association {
            Some(association)
                if now >= association.ready_at
                    && self.environment.is_visible(&association.ssid, now) =>
            {
                LinkStatus::Up {
                    ssid: association.ssid.clone(),
                    address: Ipv4Addr::new(192, 168, 1, 57),
                }
            }
            _ => LinkStatus::Down,
        }
    }

    fn access_point_address(&self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(192, 168, 4, 1))
    }
}

// ---------------------------------------------------------------------------
// HTTPS backend
// ---------------------------------------------------------------------------

/// Counters kept by [`MockBackend`], readable from the diagnostics thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackendStats {
    pub requests: u32,
    pub failures: u32,
    pub stored: u32,
    pub highest_ts: u32,
}

/// Backend that stores fixes and acknowledges the highest timestamp seen.
pub struct MockBackend<'a> {
    rng: StdRng,
    failure_rate: f64,
    stats: &'a Mutex<BackendStats>,
}

impl<'a> MockBackend<'a> {
    pub fn new(seed: u64, failure_rate: f64, stats: &'a Mutex<BackendStats>) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            failure_rate,
            stats,
        }
    }

    fn respond(&mut self, request: &UploadRequest<'_>) -> Result<HttpResponse, TransportError> {
        let latency = Duration::from_millis(self.rng.gen_range(200..4000));
        if self.rng.gen_bool(self.failure_rate) {
            return Err(if self.rng.gen_bool(0.5) {
                TransportError::Connect
            } else {
                TransportError::Timeout
            });
        }
        if latency > request.timeout {
            return Err(TransportError::Timeout);
        }
        if request.api_token.is_empty() {
            return Ok(text_response(401, r#"{"error":"unauthorized"}"#));
        }

        let fixes: Vec<serde_json::Value> = match serde_json::from_slice(request.body) {
            Ok(fixes) => fixes,
            Err(_) => return Ok(text_response(400, r#"{"error":"bad json"}"#)),
        };
        let highest = fixes
            .iter()
            .filter_map(|fix| fix.get("ts").and_then(serde_json::Value::as_u64))
            .max()
            .unwrap_or(0) as u32;

        let acked = {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.stored += fixes.len() as u32;
            stats.highest_ts = stats.highest_ts.max(highest);
            stats.highest_ts
        };
        debug!(
            "Backend stored {} fixes from {}, ackedTs={}",
            fixes.len(),
            request.device_id,
            acked
        );

        let body = serde_json::json!({ "ok": true, "inserted": fixes.len(), "ackedTs": acked });
        Ok(HttpResponse {
            status: 200,
            body: body.to_string().into_bytes(),
        })
    }
}

fn text_response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        body: body.as_bytes().to_vec(),
    }
}

impl HttpClient for MockBackend<'_> {
    async fn post(&mut self, request: &UploadRequest<'_>) -> Result<HttpResponse, TransportError> {
        let result = self.respond(request);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.requests += 1;
        if !matches!(&result, Ok(response) if response.status == 200) {
            stats.failures += 1;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// LoRa
// ---------------------------------------------------------------------------

/// Radio whose joins sometimes go unanswered and whose uplinks occasionally
/// carry MAC answers back.
pub struct MockLoraRadio {
    rng: StdRng,
    join_success_rate: f64,
    asleep: bool,
    pub uplinks: u32,
}

impl MockLoraRadio {
    pub fn new(seed: u64, join_success_rate: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            join_success_rate,
            asleep: false,
            uplinks: 0,
        }
    }

    fn mac_answers(&mut self) -> Downlink {
        let margin: u8 = self.rng.gen_range(3..25);
        let gateways: u8 = self.rng.gen_range(1..4);
        let gps_seconds = (SIM_EPOCH_START - 315_964_800 + 18).to_le_bytes();
        let mut data = heapless::Vec::new();
        let _ = data.extend_from_slice(&[0x02, margin, gateways, 0x0D]);
        let _ = data.extend_from_slice(&gps_seconds);
        let _ = data.push(0);
        Downlink {
            fport: MAC_FPORT,
            data,
        }
    }
}

impl LoraRadio for MockLoraRadio {
    type Error = &'static str;

    async fn join(&mut self, credentials: &LoraCredentials) -> Result<(), Self::Error> {
        self.asleep = false;
        debug!(
            "Join request from DevEUI {:016X} via JoinEUI {:016X}",
            credentials.dev_eui_u64(),
            credentials.join_eui_u64()
        );
        if self.rng.gen_bool(self.join_success_rate) {
            Ok(())
        } else {
            Err("no join accept received")
        }
    }

    async fn sleep(&mut self) -> Result<(), Self::Error> {
        self.asleep = true;
        Ok(())
    }

    async fn wake(&mut self) -> Result<(), Self::Error> {
        self.asleep = false;
        Ok(())
    }

    async fn send_receive(
        &mut self,
        fport: u8,
        bytes: &[u8],
    ) -> Result<Option<Downlink>, Self::Error> {
        if self.asleep {
            return Err("radio asleep");
        }
        self.uplinks += 1;

        // What the network server's payload formatter would make of it
        match payload::decode(bytes) {
            Ok(position) => {
                for warning in position.warnings() {
                    warn!("Network server: {:?}", warning);
                }
                info!(
                    "Network server: port {} ts={} lat={:.6} lon={:.6} bat={}%",
                    fport,
                    position.timestamp,
                    position.latitude_e7 as f64 / 1e7,
                    position.longitude_e7 as f64 / 1e7,
                    position.battery_percent
                );
            }
            Err(e) => warn!("Network server rejected uplink: {}", e),
        }

        Ok(self.rng.gen_bool(0.2).then(|| self.mac_answers()))
    }
}
