//! Hardware-independent core library for tracker-rs
//!
//! This crate contains the platform-agnostic telemetry pipeline of the GPS
//! tracker: the shared fix store, WiFi network arbitration with graceful
//! hand-off, the WiFi batch uplink with acknowledgment watermark, the LoRaWAN
//! movement-triggered uplink and the rule that keeps both radios from being
//! active at the same time.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).
//! Hardware is reached only through the collaborator traits
//! ([`network::WifiDriver`], [`uplink::wifi::HttpClient`],
//! [`uplink::lora::LoraRadio`]), and time is always passed in as an
//! [`embassy_time::Instant`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod metrics;
pub mod network;
pub mod power;
pub mod sampler;
pub mod storage;
pub mod timing;
pub mod uplink;
