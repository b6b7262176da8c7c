//! Device configuration
//!
//! Secrets and tuning knobs are supplied from outside the core (build-time
//! environment on the device, a JSON file or `.env` on the host). Strings are
//! borrowed from the source buffer so the firmware can keep them in flash.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::storage::DEFAULT_CAPACITY;

/// Maximum number of known WiFi networks in the priority list
pub const MAX_KNOWN_NETWORKS: usize = 4;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no known WiFi networks configured")]
    NoNetworks,
    #[error("SSID longer than 32 bytes: {0}")]
    SsidTooLong(usize),
    #[error("upload URL must use https")]
    InsecureUploadUrl,
    #[error("movement stop threshold must be below the start threshold")]
    InvertedHysteresis,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct TrackerConfig<'a> {
    /// Known networks, highest priority first
    pub networks: heapless::Vec<NetworkCredentials<'a>, MAX_KNOWN_NETWORKS>,
    pub upload: UploadEndpoint<'a>,
    pub lora: LoraCredentials,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default = "default_capacity")]
    pub store_capacity: usize,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl TrackerConfig<'_> {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.networks.is_empty() {
            return Err(ConfigError::NoNetworks);
        }
        if let Some(long) = self.networks.iter().find(|n| n.ssid.len() > 32) {
            return Err(ConfigError::SsidTooLong(long.ssid.len()));
        }
        if !self.upload.url.starts_with("https://") {
            return Err(ConfigError::InsecureUploadUrl);
        }
        if self.timings.move_stop_kmh >= self.timings.move_start_kmh {
            return Err(ConfigError::InvertedHysteresis);
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkCredentials<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
}

/// Backend endpoint for WiFi batch uploads
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadEndpoint<'a> {
    pub url: &'a str,
    /// Sent as `X-API-Token`
    pub api_token: &'a str,
    /// Sent as `X-Device-Id`
    pub device_id: &'a str,
}

/// OTAA join credentials, MSB first as shown in the network console.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoraCredentials {
    pub dev_eui: [u8; 8],
    pub join_eui: [u8; 8],
    pub app_key: [u8; 16],
    pub nwk_key: [u8; 16],
}

impl LoraCredentials {
    pub fn dev_eui_u64(&self) -> u64 {
        eui_to_u64(&self.dev_eui)
    }

    pub fn join_eui_u64(&self) -> u64 {
        eui_to_u64(&self.join_eui)
    }
}

/// Packs an MSB-first EUI into an integer.
pub fn eui_to_u64(eui: &[u8; 8]) -> u64 {
    u64::from_be_bytes(*eui)
}

/// Intervals and thresholds of every periodic task.
///
/// Defaults match the values the tracker has been field-tuned with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct Timings {
    /// WiFi scan / arbitration poll period
    pub scan_interval_secs: u32,
    /// Minimum spacing between two association attempts
    pub reconnect_backoff_secs: u32,
    pub upload_interval_secs: u32,
    pub upload_timeout_secs: u32,
    pub max_upload_batch: usize,
    pub join_retry_secs: u32,
    /// LoRa rate limit, applied whatever the trigger
    pub min_send_interval_secs: u32,
    pub heartbeat_interval_secs: u32,
    pub move_start_kmh: f32,
    pub move_stop_kmh: f32,
    pub distance_trigger_m: f32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            scan_interval_secs: 5,
            reconnect_backoff_secs: 4,
            upload_interval_secs: 60,
            upload_timeout_secs: 10,
            max_upload_batch: 60,
            join_retry_secs: 10,
            min_send_interval_secs: 150,
            heartbeat_interval_secs: 15 * 60,
            move_start_kmh: 2.0,
            move_stop_kmh: 1.0,
            distance_trigger_m: 50.0,
        }
    }
}

impl Timings {
    pub fn scan_interval(&self) -> Duration {
        secs(self.scan_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        secs(self.reconnect_backoff_secs)
    }

    pub fn upload_interval(&self) -> Duration {
        secs(self.upload_interval_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        secs(self.upload_timeout_secs)
    }

    pub fn join_retry(&self) -> Duration {
        secs(self.join_retry_secs)
    }

    pub fn min_send_interval(&self) -> Duration {
        secs(self.min_send_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_secs)
    }
}

fn secs(value: u32) -> Duration {
    Duration::from_secs(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_JSON: &str = r#"{
        "networks": [
            { "ssid": "phone-hotspot", "password": "hunter22" },
            { "ssid": "home", "password": "correct horse" }
        ],
        "upload": {
            "url": "https://example.org/gps_batch.php",
            "api_token": "token",
            "device_id": "ESP32-GPS-001"
        },
        "lora": {
            "dev_eui": [0, 0, 0, 0, 0, 0, 0, 1],
            "join_eui": [1, 2, 3, 4, 5, 6, 7, 8],
            "app_key": [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            "nwk_key": [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        },
        "timings": { "upload_interval_secs": 30 }
    }"#;

    #[test]
    fn test_parse_borrowed_config() {
        let config: TrackerConfig<'_> = serde_json::from_str(CONFIG_JSON).unwrap();

        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.networks[0].ssid, "phone-hotspot");
        assert_eq!(config.upload.device_id, "ESP32-GPS-001");
        assert_eq!(config.timings.upload_interval_secs, 30);
        assert_eq!(config.timings.heartbeat_interval_secs, 900);
        assert_eq!(config.store_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.lora.dev_eui_u64(), 1);
        assert_eq!(config.lora.join_eui_u64(), 0x0102_0304_0506_0708);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_plain_http() {
        let mut config: TrackerConfig<'_> = serde_json::from_str(CONFIG_JSON).unwrap();
        config.upload.url = "http://example.org";
        assert_eq!(config.validate(), Err(ConfigError::InsecureUploadUrl));
    }

    #[test]
    fn test_validate_rejects_inverted_hysteresis() {
        let mut config: TrackerConfig<'_> = serde_json::from_str(CONFIG_JSON).unwrap();
        config.timings.move_stop_kmh = 3.0;
        assert_eq!(config.validate(), Err(ConfigError::InvertedHysteresis));
    }

    #[test]
    fn test_default_timings() {
        let timings = Timings::default();
        assert_eq!(timings.min_send_interval(), Duration::from_secs(150));
        assert_eq!(timings.heartbeat_interval(), Duration::from_secs(900));
        assert_eq!(timings.max_upload_batch, 60);
    }
}
