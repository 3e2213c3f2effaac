//! Bluetooth fingerprint: feature vector, device-class decoding, the
//! trackability heuristic, and per-MAC behavioral profiles.

use crate::util::{canonical_json_sha256, is_randomized_mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, VecDeque};

const RSSI_HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct BtObservation {
    pub mac: String,
    pub name: Option<String>,
    pub rssi: Option<i32>,
    pub device_class: Option<u32>,
    pub service_uuids: Vec<String>,
    pub is_ble: bool,
    pub is_classic: bool,
    pub manufacturer_id: Option<u32>,
    pub tx_power: Option<i32>,
    pub timestamp: Option<i64>,
    /// The upstream daemon's per-session device key, when the observation
    /// came from the poller rather than a locally parsed advertisement.
    pub device_key: Option<String>,
    pub manuf: Option<String>,
    pub first_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtFeatures {
    pub device_class: u32,
    pub service_uuids: Vec<String>,
    pub is_ble: bool,
    pub is_classic: bool,
    pub manufacturer_id: Option<u32>,
    pub tx_power: Option<i32>,
}

impl BtFeatures {
    pub fn from_observation(obs: &BtObservation) -> Self {
        let service_uuids: Vec<String> = obs
            .service_uuids
            .iter()
            .map(|u| normalize_uuid(u))
            .filter(|u| !u.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        BtFeatures {
            device_class: obs.device_class.unwrap_or(0),
            service_uuids,
            is_ble: obs.is_ble,
            is_classic: obs.is_classic,
            manufacturer_id: obs.manufacturer_id,
            tx_power: obs.tx_power,
        }
    }

    pub fn hash(&self) -> String {
        let value = json!({
            "device_class": self.device_class,
            "service_uuids": self.service_uuids,
            "is_ble": self.is_ble,
            "is_classic": self.is_classic,
            "manufacturer_id": self.manufacturer_id,
            "tx_power": self.tx_power,
        });
        canonical_json_sha256(&value)
    }
}

/// Case-folds to upper hex and strips dashes, so `"1234"` and
/// `"0000180d-0000-1000-8000-00805f9b34fb"` both canonicalize.
fn normalize_uuid(uuid: &str) -> String {
    uuid.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Major|minor class decoding table for common Bluetooth device classes.
/// Unknown minor codes fall back to the major class name; unknown majors
/// fall back to "Unknown".
pub fn decode_device_class(class: u32) -> String {
    let major = (class >> 8) & 0x1F;
    let minor = (class >> 2) & 0x3F;

    match (major, minor) {
        (0x01, _) => "Computer".to_string(),
        (0x02, 0x01) => "Phone (Cellular)".to_string(),
        (0x02, 0x02) => "Phone (Cordless)".to_string(),
        (0x02, 0x03) => "Phone (Smartphone)".to_string(),
        (0x02, _) => "Phone".to_string(),
        (0x03, _) => "LAN/Network Access Point".to_string(),
        (0x04, 0x01) => "Audio/Video (Headset)".to_string(),
        (0x04, 0x06) => "Audio/Video (Headphones)".to_string(),
        (0x04, 0x0B) => "Audio/Video (Car Audio)".to_string(),
        (0x04, _) => "Audio/Video".to_string(),
        (0x05, 0x0F) => "Peripheral (Gamepad)".to_string(),
        (0x05, _) => "Peripheral".to_string(),
        (0x06, _) => "Imaging".to_string(),
        (0x07, _) => "Wearable".to_string(),
        (0x08, _) => "Toy".to_string(),
        (0x09, _) => "Health".to_string(),
        (0x00, _) => "Miscellaneous".to_string(),
        _ => "Unknown".to_string(),
    }
}

/// Classic-only devices are trackable; BLE devices with the
/// locally-administered MAC bit set are treated as not trackable.
pub fn is_trackable(mac: &str, is_ble: bool, is_classic: bool) -> bool {
    if is_classic && !is_ble {
        return true;
    }
    if is_ble && is_randomized_mac(mac) {
        return false;
    }
    true
}

/// Per-MAC behavioral profile: observed names, a bounded RSSI history,
/// and a cumulative detection count.
#[derive(Debug, Clone)]
pub struct BtProfile {
    pub mac: String,
    pub names_seen: BTreeSet<String>,
    pub rssi_samples: VecDeque<i32>,
    pub detection_count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl BtProfile {
    pub fn new(mac: String, timestamp: i64) -> Self {
        BtProfile {
            mac,
            names_seen: BTreeSet::new(),
            rssi_samples: VecDeque::with_capacity(RSSI_HISTORY_SIZE),
            detection_count: 0,
            first_seen: timestamp,
            last_seen: timestamp,
        }
    }

    pub fn record(&mut self, name: Option<&str>, rssi: Option<i32>, timestamp: i64) {
        self.detection_count += 1;
        self.last_seen = timestamp;
        if let Some(n) = name {
            if !n.is_empty() {
                self.names_seen.insert(n.to_string());
            }
        }
        if let Some(r) = rssi {
            if self.rssi_samples.len() >= RSSI_HISTORY_SIZE {
                self.rssi_samples.pop_front();
            }
            self.rssi_samples.push_back(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_normalization_folds_short_and_long_forms() {
        assert_eq!(normalize_uuid("180d"), "180D");
        assert_eq!(
            normalize_uuid("0000180d-0000-1000-8000-00805f9b34fb"),
            "0000180D00001000800000805F9B34FB"
        );
    }

    #[test]
    fn classic_only_device_is_trackable() {
        assert!(is_trackable("00:11:22:33:44:55", false, true));
    }

    #[test]
    fn ble_with_randomized_mac_is_not_trackable() {
        assert!(!is_trackable("02:11:22:33:44:55", true, false));
    }

    #[test]
    fn ble_with_static_mac_is_trackable() {
        assert!(is_trackable("00:11:22:33:44:55", true, false));
    }

    #[test]
    fn rssi_history_is_bounded() {
        let mut profile = BtProfile::new("AA:BB:CC:DD:EE:FF".to_string(), 0);
        for i in 0..150 {
            profile.record(None, Some(-i), i as i64);
        }
        assert_eq!(profile.rssi_samples.len(), RSSI_HISTORY_SIZE);
        assert_eq!(profile.detection_count, 150);
    }

    #[test]
    fn device_class_decoding_falls_back_gracefully() {
        assert_eq!(decode_device_class(0x0000), "Miscellaneous");
        assert!(decode_device_class(0xFFFFFF).contains("Unknown") || !decode_device_class(0xFFFFFF).is_empty());
    }
}
