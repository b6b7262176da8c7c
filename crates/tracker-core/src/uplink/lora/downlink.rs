//! Downlink inspection
//!
//! The tracker takes no commands from the network. Downlinks are only looked
//! at for the MAC answers that tell how well the device is being heard.

use log::{debug, info};

/// Largest LoRaWAN application payload
pub const MAX_DOWNLINK_LEN: usize = 242;

/// Port carrying MAC commands only
pub const MAC_FPORT: u8 = 0;

const CID_LINK_CHECK_ANS: u8 = 0x02;
const CID_DEVICE_TIME_ANS: u8 = 0x0D;

/// Seconds between the Unix and GPS epochs
const GPS_EPOCH_UNIX_SECS: u32 = 315_964_800;
/// GPS-UTC offset in effect since 2017
const GPS_LEAP_SECONDS: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downlink {
    pub fport: u8,
    pub data: heapless::Vec<u8, MAX_DOWNLINK_LEN>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCheck {
    /// Demodulation margin of the last uplink in dB
    pub margin_db: u8,
    pub gateways: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTime {
    /// Seconds since the GPS epoch
    pub gps_seconds: u32,
    /// Fractional second in 1/256 s steps
    pub fraction: u8,
}

impl DeviceTime {
    pub fn unix_seconds(&self) -> u32 {
        self.gps_seconds
            .wrapping_add(GPS_EPOCH_UNIX_SECS)
            .wrapping_sub(GPS_LEAP_SECONDS)
    }

    pub fn millis(&self) -> u16 {
        (self.fraction as u32 * 1000 / 256) as u16
    }
}

/// Last known network status, for display only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStatus {
    pub downlinks: u32,
    pub last_fport: Option<u8>,
    pub link_check: Option<LinkCheck>,
    pub device_time: Option<DeviceTime>,
}

impl NetworkStatus {
    pub fn apply(&mut self, downlink: &Downlink) {
        self.downlinks = self.downlinks.wrapping_add(1);
        self.last_fport = Some(downlink.fport);
        debug!("Downlink on port {}: {:02X?}", downlink.fport, downlink.data.as_slice());

        if downlink.fport == MAC_FPORT {
            self.apply_mac_commands(&downlink.data);
        }
    }

    fn apply_mac_commands(&mut self, mut data: &[u8]) {
        while let Some((&cid, rest)) = data.split_first() {
            let len = match answer_len(cid) {
                Some(len) if rest.len() >= len => len,
                _ => {
                    debug!("Stopping MAC parse at CID 0x{:02X}", cid);
                    return;
                }
            };
            let (body, tail) = rest.split_at(len);

            match cid {
                CID_LINK_CHECK_ANS => {
                    let check = LinkCheck {
                        margin_db: body[0],
                        gateways: body[1],
                    };
                    info!(
                        "LinkCheckAns: margin {} dB, {} gateways",
                        check.margin_db, check.gateways
                    );
                    self.link_check = Some(check);
                }
                CID_DEVICE_TIME_ANS => {
                    let time = DeviceTime {
                        gps_seconds: u32::from_le_bytes([body[0], body[1], body[2], body[3]]),
                        fraction: body[4],
                    };
                    info!("DeviceTimeAns: unix {}.{:03}", time.unix_seconds(), time.millis());
                    self.device_time = Some(time);
                }
                _ => {}
            }
            data = tail;
        }
    }
}

/// Payload length of network-to-device MAC commands (LoRaWAN 1.0.x).
fn answer_len(cid: u8) -> Option<usize> {
    match cid {
        0x02 => Some(2),
        0x03 => Some(4),
        0x04 => Some(1),
        0x05 => Some(4),
        0x06 => Some(0),
        0x07 => Some(5),
        0x08 => Some(1),
        0x09 => Some(1),
        0x0A => Some(4),
        0x0D => Some(5),
        _ => None,
    }
}
