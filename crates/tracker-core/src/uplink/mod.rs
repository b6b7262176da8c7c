//! Uplink pipelines
//!
//! Two independent consumers of the fix store: [`wifi::WifiUplink`] drains
//! every unacknowledged fix in batches whenever a station association exists,
//! [`lora::LoraUplink`] sends only the latest fix when movement, distance or
//! the heartbeat asks for it.

pub mod lora;
pub mod wifi;
