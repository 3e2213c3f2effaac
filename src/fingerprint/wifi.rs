//! Wi-Fi fingerprint: feature vector, canonicalization, profile tracking,
//! and the heuristic device-type inference used for reporting only.

use crate::util::canonical_json_sha256;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

const WPS_OUI: &str = "0050F2";
const WPS_TYPE: u8 = 4;

#[derive(Debug, Clone)]
pub struct VendorIe {
    pub oui: String,
    pub vendor_type: u8,
}

#[derive(Debug, Clone, Default)]
pub struct WifiObservation {
    pub mac: String,
    pub ssid: Option<String>,
    pub rssi: Option<i32>,
    pub rates: Vec<u32>,
    pub ht_supported: bool,
    pub ht_caps: u16,
    pub vht_supported: bool,
    pub vht_caps: u32,
    pub he_supported: bool,
    pub vendor_ies: Vec<VendorIe>,
    pub channel: Option<u32>,
    pub timestamp: Option<i64>,
    /// The upstream daemon's per-session device key, when the observation
    /// came from the poller rather than a locally parsed probe frame.
    pub device_key: Option<String>,
    pub manuf: Option<String>,
    pub frequency: Option<u32>,
    pub first_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiFeatures {
    pub rates: Vec<u32>,
    pub ht_supported: bool,
    pub ht_caps: u16,
    pub vht_supported: bool,
    pub vht_caps: u32,
    pub he_supported: bool,
    pub wps_enabled: bool,
    pub vendor_ouis: Vec<String>,
    pub probe_ssids: Vec<String>,
}

impl WifiFeatures {
    pub fn from_observation(obs: &WifiObservation, probed_ssids: &BTreeSet<String>) -> Self {
        let mut rates: Vec<u32> = obs.rates.clone();
        rates.sort_unstable();
        rates.dedup();

        let wps_enabled = obs
            .vendor_ies
            .iter()
            .any(|ie| ie.oui.eq_ignore_ascii_case(WPS_OUI) && ie.vendor_type == WPS_TYPE);

        let vendor_ouis: Vec<String> = obs
            .vendor_ies
            .iter()
            .map(|ie| ie.oui.to_ascii_uppercase())
            .filter(|o| !o.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        WifiFeatures {
            rates,
            ht_supported: obs.ht_supported,
            ht_caps: if obs.ht_supported { obs.ht_caps } else { 0 },
            vht_supported: obs.vht_supported,
            vht_caps: if obs.vht_supported { obs.vht_caps } else { 0 },
            he_supported: obs.he_supported,
            wps_enabled,
            vendor_ouis,
            probe_ssids: probed_ssids.iter().cloned().collect(),
        }
    }

    pub fn hash(&self) -> String {
        let value = json!({
            "rates": self.rates,
            "ht_supported": self.ht_supported,
            "ht_caps": self.ht_caps,
            "vht_supported": self.vht_supported,
            "vht_caps": self.vht_caps,
            "he_supported": self.he_supported,
            "wps_enabled": self.wps_enabled,
            "vendor_ouis": self.vendor_ouis,
            "probe_ssids": self.probe_ssids,
        });
        canonical_json_sha256(&value)
    }

    /// Heuristic-only classification, never part of the hash.
    pub fn infer_device_type(&self) -> &'static str {
        if self.vht_supported && self.ht_supported && self.rates.len() >= 8 {
            "smartphone"
        } else if self.vht_supported && self.vendor_ouis.len() > 3 {
            "laptop"
        } else if !self.ht_supported && self.rates.len() <= 4 {
            "iot"
        } else if !self.ht_supported && self.rates.contains(&54) {
            "legacy_g"
        } else if !self.ht_supported && self.rates.iter().all(|r| *r <= 11) {
            "legacy_b"
        } else {
            "unknown"
        }
    }
}

/// Per-MAC behavioral profile the engine maintains across observations.
#[derive(Debug, Clone)]
pub struct ProbeProfile {
    pub mac: String,
    pub probed_ssids: BTreeSet<String>,
    pub probe_count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    /// The most recently computed fingerprint hash for this MAC, kept
    /// so `FingerprintEngine::correlate_randomized` can group profiles
    /// without recomputing their feature vectors.
    pub last_hash: Option<String>,
}

impl ProbeProfile {
    pub fn new(mac: String, timestamp: i64) -> Self {
        ProbeProfile {
            mac,
            probed_ssids: BTreeSet::new(),
            probe_count: 0,
            first_seen: timestamp,
            last_seen: timestamp,
            last_hash: None,
        }
    }

    /// Records a probe; empty SSIDs are counted but never added to the set.
    pub fn record(&mut self, ssid: Option<&str>, timestamp: i64) {
        self.probe_count += 1;
        self.last_seen = timestamp;
        if let Some(s) = ssid {
            if !s.is_empty() {
                self.probed_ssids.insert(s.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs() -> WifiObservation {
        WifiObservation {
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            ssid: Some("HomeNet".to_string()),
            rssi: Some(-60),
            rates: vec![54, 48, 36, 24, 18, 12, 9, 6],
            ht_supported: true,
            ht_caps: 0x1234,
            vht_supported: true,
            vht_caps: 0x5678,
            he_supported: false,
            vendor_ies: vec![VendorIe { oui: "0050F2".to_string(), vendor_type: 4 }],
            channel: Some(6),
            timestamp: Some(1000),
            device_key: None,
            manuf: None,
            frequency: None,
            first_time: None,
        }
    }

    #[test]
    fn identical_feature_vectors_hash_equal_regardless_of_order() {
        let mut obs_a = obs();
        obs_a.rates = vec![6, 9, 12, 18, 24, 36, 48, 54];
        let mut obs_b = obs();
        obs_b.rates = vec![54, 48, 36, 24, 18, 12, 9, 6];

        let set = BTreeSet::new();
        let fa = WifiFeatures::from_observation(&obs_a, &set);
        let fb = WifiFeatures::from_observation(&obs_b, &set);
        assert_eq!(fa.hash(), fb.hash());
        assert_eq!(fa.hash().len(), 64);
    }

    #[test]
    fn wps_detected_from_vendor_ie() {
        let set = BTreeSet::new();
        let features = WifiFeatures::from_observation(&obs(), &set);
        assert!(features.wps_enabled);
    }

    #[test]
    fn device_type_precedence_smartphone_before_laptop() {
        let set = BTreeSet::new();
        let features = WifiFeatures::from_observation(&obs(), &set);
        assert_eq!(features.infer_device_type(), "smartphone");
    }

    #[test]
    fn probe_profile_excludes_empty_ssid_from_set_but_counts_it() {
        let mut profile = ProbeProfile::new("AA:BB:CC:DD:EE:FF".to_string(), 1000);
        profile.record(Some(""), 1001);
        profile.record(Some("Net1"), 1002);
        assert_eq!(profile.probe_count, 2);
        assert_eq!(profile.probed_ssids.len(), 1);
    }
}
