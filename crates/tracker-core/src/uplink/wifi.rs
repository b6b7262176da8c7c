//! Batch upload of unacknowledged fixes over WiFi
//!
//! Each cycle sends every fix newer than the acknowledgment watermark (up to
//! the batch limit) as one JSON array. The backend answers with the highest
//! timestamp it has stored, and only that answer moves the watermark, so a
//! lost response simply means the same fixes are sent again.

use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::config::{Timings, UploadEndpoint};
use crate::metrics::{Channel, TxStats};
use crate::network::SharedNetwork;
use crate::storage::{FixRecord, FixStore, StoreError};
use crate::timing::Cadence;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const HEADER_API_TOKEN: &str = "X-API-Token";
pub const HEADER_DEVICE_ID: &str = "X-Device-Id";

/// One HTTPS POST of a JSON body.
#[derive(Debug, Clone, Copy)]
pub struct UploadRequest<'a> {
    pub url: &'a str,
    /// Value of [`HEADER_API_TOKEN`]
    pub api_token: &'a str,
    /// Value of [`HEADER_DEVICE_ID`]
    pub device_id: &'a str,
    /// Always [`CONTENT_TYPE_JSON`]
    pub body: &'a [u8],
    /// Upper bound on the whole exchange
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed")]
    Connect,
    #[error("I/O error during exchange")]
    Io,
}

/// HTTPS client used by the WiFi uplink.
///
/// Implementations must give up after `request.timeout` and report
/// [`TransportError::Timeout`].
pub trait HttpClient {
    fn post(
        &mut self,
        request: &UploadRequest<'_>,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadError {
    #[error("fix store: {0}")]
    Store(StoreError),
    #[error("transport: {0}")]
    Transport(TransportError),
    #[error("backend answered HTTP {0}")]
    Status(u16),
    #[error("acknowledgment body could not be parsed")]
    MalformedAck,
    #[error("batch could not be serialized")]
    Encode,
}

impl From<StoreError> for UploadError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// What an upload cycle did when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Upload interval has not elapsed
    NotDue,
    /// No station association
    Offline,
    /// Admission refused while a network switch is pending
    Refused,
    /// Nothing newer than the watermark
    Empty,
    /// Watermark advanced to `acked_ts`
    Acknowledged { fixes: usize, acked_ts: u32 },
    /// Backend acknowledged nothing newer than the watermark
    Stale { acked_ts: u32 },
}

#[derive(Serialize)]
struct WireFix<'a> {
    seq: u32,
    ts: u32,
    #[serde(rename = "latE7")]
    lat_e7: i32,
    #[serde(rename = "lonE7")]
    lon_e7: i32,
    net: &'a str,
    ch: &'static str,
    bat: u8,
    flags: u8,
}

impl<'a> WireFix<'a> {
    fn new(record: &FixRecord, net: &'a str) -> Self {
        Self {
            seq: record.sequence,
            ts: record.timestamp,
            lat_e7: record.latitude_e7,
            lon_e7: record.longitude_e7,
            net,
            ch: Channel::Wifi.label(),
            bat: record.battery_percent,
            flags: record.flags.bits(),
        }
    }
}

#[derive(Deserialize)]
struct Ack {
    #[serde(rename = "ackedTs")]
    acked_ts: u32,
}

/// Serializes a batch as the JSON array the backend expects.
pub fn encode_batch(batch: &[FixRecord], net: &str) -> Result<Vec<u8>, UploadError> {
    let wire: Vec<WireFix<'_>> = batch.iter().map(|r| WireFix::new(r, net)).collect();
    serde_json::to_vec(&wire).map_err(|_| UploadError::Encode)
}

/// Extracts `ackedTs` from a backend response body. Extra fields are ignored.
pub fn parse_ack(body: &[u8]) -> Result<u32, UploadError> {
    serde_json::from_slice::<Ack>(body)
        .map(|ack| ack.acked_ts)
        .map_err(|_| UploadError::MalformedAck)
}

/// Periodic WiFi batch uploader.
pub struct WifiUplink<'a, M: RawMutex, H: HttpClient> {
    client: H,
    store: &'a FixStore<M>,
    network: &'a SharedNetwork<M>,
    stats: &'a TxStats,
    endpoint: UploadEndpoint<'a>,
    cadence: Cadence,
    timeout: Duration,
    max_batch: usize,
}

impl<'a, M: RawMutex, H: HttpClient> WifiUplink<'a, M, H> {
    pub fn new(
        client: H,
        store: &'a FixStore<M>,
        network: &'a SharedNetwork<M>,
        stats: &'a TxStats,
        endpoint: UploadEndpoint<'a>,
        timings: &Timings,
    ) -> Self {
        Self {
            client,
            store,
            network,
            stats,
            endpoint,
            cadence: Cadence::new(timings.upload_interval()),
            timeout: timings.upload_timeout(),
            max_batch: timings.max_upload_batch,
        }
    }

    pub fn client(&self) -> &H {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut H {
        &mut self.client
    }

    /// Runs an upload cycle if the upload interval has elapsed.
    ///
    /// Failures are logged and leave the watermark untouched; the next cycle
    /// retries the same fixes.
    pub async fn update(&mut self, now: Instant) -> Result<UploadOutcome, UploadError> {
        if !self.cadence.poll(now) {
            return Ok(UploadOutcome::NotDue);
        }

        let result = self.upload_once(now).await;
        match &result {
            Ok(outcome) => debug!("WiFi upload cycle: {:?}", outcome),
            Err(e) => warn!("WiFi upload failed: {}", e),
        }
        result
    }

    /// Runs one upload cycle now, ignoring the interval.
    pub async fn upload_once(&mut self, now: Instant) -> Result<UploadOutcome, UploadError> {
        if !self.network.is_connected() {
            return Ok(UploadOutcome::Offline);
        }

        // Held until return so the arbitrator cannot switch networks under us.
        let _permit = match self.network.begin_upload() {
            Ok(permit) => permit,
            Err(e) => {
                debug!("WiFi upload skipped: {}", e);
                return Ok(UploadOutcome::Refused);
            }
        };

        let watermark = self.store.acked_watermark()?;
        let batch = self.store.batch_after(self.max_batch, watermark)?;
        if batch.is_empty() {
            return Ok(UploadOutcome::Empty);
        }

        let net = self.network.ssid();
        let body = encode_batch(&batch, &net)?;
        let request = UploadRequest {
            url: self.endpoint.url,
            api_token: self.endpoint.api_token,
            device_id: self.endpoint.device_id,
            body: &body,
            timeout: self.timeout,
        };

        let response = {
            let _in_flight = self.stats.begin_transmission();
            self.client.post(&request).await?
        };

        if response.status != 200 {
            return Err(UploadError::Status(response.status));
        }
        let acked_ts = parse_ack(&response.body)?;

        if self.store.set_acked_watermark(acked_ts)? {
            self.stats.record(now, batch.len() as u32);
            info!(
                "Uploaded {} fixes over '{}', acknowledged up to ts={}",
                batch.len(),
                net,
                acked_ts
            );
            Ok(UploadOutcome::Acknowledged {
                fixes: batch.len(),
                acked_ts,
            })
        } else {
            Ok(UploadOutcome::Stale { acked_ts })
        }
    }
}
