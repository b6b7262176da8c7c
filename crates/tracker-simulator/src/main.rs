//! Host simulator for the tracker-rs telemetry pipeline.
//!
//! Runs the real tracker-core tasks (sampler, network arbitrator, WiFi batch
//! uplink, LoRa uplink behind the radio power arbiter) on one thread each,
//! against a simulated world on an accelerated clock:
//!
//! - a GPS receiver alternating between resting and walking,
//! - known WiFi networks drifting in and out of range, with dead zones,
//! - an HTTPS backend that acknowledges the highest timestamp it stored and
//!   fails a configurable share of requests,
//! - a LoRaWAN radio whose joins are sometimes not answered.
//!
//! Configuration comes from a JSON file (`--config`) or from `TRACKER_*`
//! environment variables, which may be kept in a `.env` file.

mod mocks;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use clap::Parser;
use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant};
use log::{error, info};

use tracker_core::config::{
    LoraCredentials, MAX_KNOWN_NETWORKS, NetworkCredentials, Timings, TrackerConfig,
    UploadEndpoint,
};
use tracker_core::metrics::{Channel, TxStats};
use tracker_core::network::{NetworkArbitrator, SharedNetwork};
use tracker_core::power::RadioPowerArbiter;
use tracker_core::sampler::record_sample;
use tracker_core::storage::FixStore;
use tracker_core::uplink::lora::LoraUplink;
use tracker_core::uplink::wifi::WifiUplink;

use mocks::{BackendStats, GpsWalker, MockBackend, MockLoraRadio, MockWifi, RadioEnvironment, SimClock};

type Store = FixStore<CriticalSectionRawMutex>;
type Network = SharedNetwork<CriticalSectionRawMutex>;

/// Simulated interval between GPS samples.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Simulated tick of the polling tasks.
const TASK_TICK: Duration = Duration::from_secs(1);

/// Simulated interval between diagnostics lines.
const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(120);

/// Where the simulated walk starts (Paris).
const START_POSITION: (f64, f64) = (48.8566, 2.3522);

#[derive(Parser, Debug)]
#[command(name = "tracker-simulator")]
#[command(about = "Runs the tracker telemetry pipeline against a simulated world", long_about = None)]
struct Cli {
    /// JSON configuration file; `TRACKER_*` environment variables otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulated run time in seconds
    #[arg(long, default_value = "3600")]
    duration_secs: u64,

    /// Simulated seconds per real second
    #[arg(long, default_value = "60")]
    time_scale: f64,

    /// Fix store capacity, overriding the configuration
    #[arg(long)]
    capacity: Option<usize>,

    /// Share of backend requests that fail
    #[arg(long, default_value = "0.15")]
    failure_rate: f64,

    /// Seed for every random source in the simulated world
    #[arg(long, default_value = "7")]
    seed: u64,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Owned configuration values the borrowed [`TrackerConfig`] points into.
struct EnvConfig {
    networks: Vec<(String, String)>,
    upload_url: String,
    api_token: String,
    device_id: String,
    lora: LoraCredentials,
}

impl EnvConfig {
    /// Reads `TRACKER_*` variables, falling back to demo values.
    ///
    /// `TRACKER_NETWORKS` is a comma separated `ssid:password` list, highest
    /// priority first. EUIs and keys are hex strings, MSB first.
    fn from_env() -> Result<Self, Box<dyn Error>> {
        let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.into());

        let networks = var("TRACKER_NETWORKS", "phone-hotspot:hotspot-pass,home:home-pass")
            .split(',')
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once(':') {
                Some((ssid, password)) => (ssid.to_string(), password.to_string()),
                None => (entry.to_string(), String::new()),
            })
            .collect();

        let lora = LoraCredentials {
            dev_eui: parse_hex(&var("TRACKER_DEV_EUI", "70B3D57ED0000001"))?,
            join_eui: parse_hex(&var("TRACKER_JOIN_EUI", "0000000000000000"))?,
            app_key: parse_hex(&var("TRACKER_APP_KEY", &"00".repeat(16)))?,
            nwk_key: parse_hex(&var("TRACKER_NWK_KEY", &"00".repeat(16)))?,
        };

        Ok(Self {
            networks,
            upload_url: var("TRACKER_UPLOAD_URL", "https://tracker.example.org/gps_batch.php"),
            api_token: var("TRACKER_API_TOKEN", "simulator-token"),
            device_id: var("TRACKER_DEVICE_ID", "ESP32-GPS-SIM"),
            lora,
        })
    }

    fn tracker_config(&self) -> Result<TrackerConfig<'_>, Box<dyn Error>> {
        let mut networks = heapless::Vec::new();
        for (ssid, password) in &self.networks {
            networks
                .push(NetworkCredentials { ssid, password })
                .map_err(|_| format!("at most {MAX_KNOWN_NETWORKS} networks are supported"))?;
        }

        Ok(TrackerConfig {
            networks,
            upload: UploadEndpoint {
                url: &self.upload_url,
                api_token: &self.api_token,
                device_id: &self.device_id,
            },
            lora: self.lora,
            timings: Timings::default(),
            store_capacity: tracker_core::storage::DEFAULT_CAPACITY,
        })
    }
}

fn parse_hex<const N: usize>(text: &str) -> Result<[u8; N], Box<dyn Error>> {
    let text = text.trim();
    if text.len() != N * 2 || !text.is_ascii() {
        return Err(format!("expected {} hex digits, got '{}'", N * 2, text).into());
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)?;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Shared handles every task thread borrows.
struct Shared<'a> {
    clock: &'a SimClock,
    end: Instant,
    store: &'a Store,
    network: &'a Network,
    wifi_stats: &'a TxStats,
    lora_stats: &'a TxStats,
    /// Latest GPS speed as `f32` bits, for the LoRa task
    speed_bits: &'a AtomicU32,
}

impl Shared<'_> {
    /// Sleeps one simulated `tick`; returns the new time while still running.
    fn next(&self, tick: Duration) -> Option<Instant> {
        std::thread::sleep(self.clock.real(tick));
        let now = self.clock.now();
        (now < self.end).then_some(now)
    }
}

fn sampler_task(shared: &Shared<'_>, seed: u64) {
    let mut walker = GpsWalker::new(seed, START_POSITION.0, START_POSITION.1);
    let mut now = shared.clock.now();
    let mut last = now;

    loop {
        let dt = now.saturating_duration_since(last).as_micros() as f64 / 1e6;
        let sample = walker.advance(now, dt);
        shared
            .speed_bits
            .store(sample.speed_or_zero().to_bits(), Ordering::Relaxed);
        // Rejections are logged inside; the next sample is another chance.
        let _ = record_sample(shared.store, &sample, now);

        last = now;
        match shared.next(SAMPLE_INTERVAL) {
            Some(t) => now = t,
            None => break,
        }
    }
}

fn arbitrator_task(
    shared: &Shared<'_>,
    config: &TrackerConfig<'_>,
    environment: &RadioEnvironment,
) {
    let driver = MockWifi::new(shared.clock, environment);
    let mut arbitrator = NetworkArbitrator::new(
        driver,
        &config.networks,
        shared.network,
        config.timings.scan_interval(),
        config.timings.reconnect_backoff(),
    );

    let mut now = shared.clock.now();
    loop {
        arbitrator.update(now);
        match shared.next(TASK_TICK) {
            Some(t) => now = t,
            None => break,
        }
    }
}

fn wifi_task(shared: &Shared<'_>, config: &TrackerConfig<'_>, backend: MockBackend<'_>) {
    let mut uplink = WifiUplink::new(
        backend,
        shared.store,
        shared.network,
        shared.wifi_stats,
        config.upload,
        &config.timings,
    );

    let mut now = shared.clock.now();
    loop {
        // Outcomes and failures are logged by the uplink itself.
        let _ = block_on(uplink.update(now));
        match shared.next(TASK_TICK) {
            Some(t) => now = t,
            None => break,
        }
    }
}

fn lora_task(shared: &Shared<'_>, config: &TrackerConfig<'_>, seed: u64) {
    let radio = MockLoraRadio::new(seed, 0.6);
    let mut lora = LoraUplink::new(
        radio,
        shared.store,
        shared.lora_stats,
        config.lora,
        &config.timings,
        shared.clock.now(),
    );
    let mut power = RadioPowerArbiter::new();

    let mut now = shared.clock.now();
    loop {
        let speed = f32::from_bits(shared.speed_bits.load(Ordering::Relaxed));
        let _ = block_on(power.tick(shared.network, &mut lora, now, speed));
        match shared.next(TASK_TICK) {
            Some(t) => now = t,
            None => break,
        }
    }

    let status = lora.network_status();
    info!(
        "LoRa: {} uplinks, {} downlinks, link check {:?}, device time {:?}",
        lora.radio().uplinks,
        status.downlinks,
        status.link_check,
        status.device_time.map(|t| t.unix_seconds())
    );
}

fn diagnostics_task(shared: &Shared<'_>, backend: &Mutex<BackendStats>) {
    while shared.next(DIAGNOSTICS_INTERVAL).is_some() {
        log_diagnostics(shared, backend);
    }
    log_diagnostics(shared, backend);
}

fn log_diagnostics(shared: &Shared<'_>, backend: &Mutex<BackendStats>) {
    let net = shared.network.snapshot();
    let backend = *backend.lock().unwrap_or_else(|e| e.into_inner());
    let last_tx = |stats: &TxStats| match stats.last_tx() {
        Some(t) => format!("{}s", t.as_secs()),
        None => "never".into(),
    };

    info!(
        "[t={:>5}s] store {}/{} acked<= {} | wifi {} '{}' accept={} uploads={} reason='{}' | \
         tx wifi {} (last {}) lora {} (last {}) | backend {} req {} fail {} stored",
        shared.clock.now().as_secs(),
        shared.store.len().unwrap_or(0),
        shared.store.capacity().unwrap_or(0),
        shared.store.acked_watermark().unwrap_or(0),
        if net.connected { "up" } else { "down" },
        net.ssid,
        net.accept_uploads,
        net.active_uploads,
        net.reason,
        shared.wifi_stats.count(),
        last_tx(shared.wifi_stats),
        shared.lora_stats.count(),
        last_tx(shared.lora_stats),
        backend.requests,
        backend.failures,
        backend.stored,
    );
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let env_config;
    let file_text;
    let mut config = match &cli.config {
        Some(path) => {
            file_text = std::fs::read_to_string(path)
                .map_err(|e| format!("reading {}: {e}", path.display()))?;
            serde_json::from_str::<TrackerConfig<'_>>(&file_text)
                .map_err(|e| format!("parsing {}: {e}", path.display()))?
        }
        None => {
            env_config = EnvConfig::from_env()?;
            env_config.tracker_config()?
        }
    };
    if let Some(capacity) = cli.capacity {
        config.store_capacity = capacity;
    }
    config.validate().map_err(|e| format!("invalid configuration: {e}"))?;
    if cli.time_scale.is_nan() || cli.time_scale <= 0.0 {
        return Err("--time-scale must be positive".into());
    }

    info!(
        "Simulating {} s at {}x, {} known networks, store capacity {}",
        cli.duration_secs,
        cli.time_scale,
        config.networks.len(),
        config.store_capacity
    );
    for (priority, network) in config.networks.iter().enumerate() {
        info!("  network {}: '{}'", priority, network.ssid);
    }

    let clock = SimClock::new(cli.time_scale);
    let environment =
        RadioEnvironment::new(config.networks.iter().map(|n| n.ssid.to_string()).collect());
    let store = Store::new(config.store_capacity);
    let network = Network::new();
    let wifi_stats = TxStats::new(Channel::Wifi);
    let lora_stats = TxStats::new(Channel::Lora);
    let backend_stats = Mutex::new(BackendStats::default());
    let speed_bits = AtomicU32::new(0f32.to_bits());

    let shared = Shared {
        clock: &clock,
        end: Instant::from_secs(cli.duration_secs),
        store: &store,
        network: &network,
        wifi_stats: &wifi_stats,
        lora_stats: &lora_stats,
        speed_bits: &speed_bits,
    };
    let backend = MockBackend::new(cli.seed.wrapping_add(1), cli.failure_rate, &backend_stats);

    std::thread::scope(|s| {
        s.spawn(|| sampler_task(&shared, cli.seed));
        s.spawn(|| arbitrator_task(&shared, &config, &environment));
        s.spawn(|| wifi_task(&shared, &config, backend));
        s.spawn(|| lora_task(&shared, &config, cli.seed.wrapping_add(2)));
        s.spawn(|| diagnostics_task(&shared, &backend_stats));
    });

    info!(
        "Done: {} fixes acknowledged over WiFi up to ts={}, {} LoRa payloads",
        wifi_stats.count(),
        store.acked_watermark().unwrap_or(0),
        lora_stats.count()
    );
    Ok(())
}

fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting tracker-rs simulator");

    if let Err(e) = run(Cli::parse()) {
        error!("{e}");
        std::process::exit(1);
    }

    info!("Simulator exiting");
}
