//! Fingerprint Engine: derives a stable canonical hash for a device from
//! its passive observations, accumulates a behavioral profile, geotags
//! the result with the GPS service's current position, and hands it to
//! the Store when auto-store is enabled.

pub mod bt;
pub mod wifi;

use crate::gps::GpsService;
use crate::oui;
use crate::poller::UpstreamDevice;
use crate::store::models::{BtDevice as StoreBtDevice, FingerprintSignature, WifiDevice as StoreWifiDevice};
use crate::store::Store;
use crate::util::{is_randomized_mac, normalize_mac};
use bt::{BtFeatures, BtObservation, BtProfile};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wifi::{ProbeProfile, WifiFeatures, WifiObservation};

#[derive(Debug, Clone, Default)]
pub struct FingerprintStats {
    pub wifi_fingerprints: u64,
    pub bt_fingerprints: u64,
    pub randomized_macs_detected: u64,
    pub wifi_cache_size: usize,
    pub bt_cache_size: usize,
}

type SignatureCallback = Box<dyn Fn(&str, &str, &serde_json::Value) + Send>;

struct Inner {
    wifi_profiles: HashMap<String, ProbeProfile>,
    bt_profiles: HashMap<String, BtProfile>,
    stats: FingerprintStats,
    signature_callbacks: Vec<SignatureCallback>,
    session_id: Option<String>,
}

pub struct FingerprintEngine {
    inner: Mutex<Inner>,
    gps: Option<Arc<GpsService>>,
    store: Option<Arc<Store>>,
    auto_store: bool,
}

impl FingerprintEngine {
    pub fn new(gps: Option<Arc<GpsService>>, store: Option<Arc<Store>>, auto_store: bool) -> Self {
        FingerprintEngine {
            inner: Mutex::new(Inner {
                wifi_profiles: HashMap::new(),
                bt_profiles: HashMap::new(),
                stats: FingerprintStats::default(),
                signature_callbacks: Vec::new(),
                session_id: None,
            }),
            gps,
            store,
            auto_store,
        }
    }

    pub fn set_session(&self, session_id: String) {
        self.inner.lock().unwrap().session_id = Some(session_id);
    }

    pub fn on_signature(&self, cb: SignatureCallback) {
        self.inner.lock().unwrap().signature_callbacks.push(cb);
    }

    fn current_geo(&self) -> (Option<f64>, Option<f64>, Option<f64>, bool) {
        match &self.gps {
            Some(gps) => {
                let pos = gps.current();
                if pos.valid {
                    (Some(pos.lat), Some(pos.lon), Some(pos.alt), true)
                } else {
                    (None, None, None, false)
                }
            }
            None => (None, None, None, false),
        }
    }

    pub fn on_wifi_probe(&self, obs: WifiObservation) -> String {
        let mac = normalize_mac(&obs.mac);
        let timestamp = obs.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let mut inner = self.inner.lock().unwrap();

        let randomized = is_randomized_mac(&mac);
        if randomized {
            inner.stats.randomized_macs_detected += 1;
        }

        let profile = inner
            .wifi_profiles
            .entry(mac.clone())
            .or_insert_with(|| ProbeProfile::new(mac.clone(), obs.first_time.unwrap_or(timestamp)));
        profile.record(obs.ssid.as_deref(), timestamp);
        let probed_ssids = profile.probed_ssids.clone();
        let first_seen = profile.first_seen;
        let last_seen = profile.last_seen;
        let probe_count = profile.probe_count;

        let features = WifiFeatures::from_observation(&obs, &probed_ssids);
        let hash = features.hash();
        if let Some(profile) = inner.wifi_profiles.get_mut(&mac) {
            profile.last_hash = Some(hash.clone());
        }

        inner.stats.wifi_fingerprints += 1;
        inner.stats.wifi_cache_size = inner.wifi_profiles.len();

        let signature_data = serde_json::to_value(&features).unwrap_or_default();
        for cb in &inner.signature_callbacks {
            cb("wifi", &hash, &signature_data);
        }

        let session_id = inner.session_id.clone();
        drop(inner);

        if self.auto_store {
            if let (Some(store), Some(session_id)) = (&self.store, session_id) {
                let (lat, lon, alt, gps_valid) = self.current_geo();
                let device = StoreWifiDevice {
                    device_key: obs.device_key.clone().unwrap_or_else(|| mac.clone()),
                    bssid: mac.clone(),
                    essid: obs.ssid.clone(),
                    device_type: features.infer_device_type().to_string(),
                    channel: obs.channel.map(|c| c as i32),
                    frequency: obs.frequency.map(|f| f as i32),
                    signal_dbm: obs.rssi,
                    encryption: None,
                    manuf: obs.manuf.clone().or_else(|| oui::lookup_vendor(&mac).map(|v| v.to_string())),
                    packets_total: probe_count as i64,
                    first_seen,
                    last_seen,
                    lat,
                    lon,
                    alt,
                    gps_valid,
                    fingerprint_hash: Some(hash.clone()),
                    fingerprint_data: serde_json::to_string(&features).ok(),
                    is_known: false,
                    identified_as: None,
                    is_duplicate: false,
                    duplicate_of_id: None,
                    seen_by_nodes: Vec::new(),
                };
                if let Err(e) = store.insert_wifi_device(&session_id, &device) {
                    debug!("failed to submit wifi fingerprint to store: {e}");
                }
                let sig = FingerprintSignature {
                    fingerprint_hash: hash.clone(),
                    device_type: "wifi".to_string(),
                    model: None,
                    os_version: None,
                    confidence: 0.0,
                    identifiers: None,
                    first_seen,
                    times_seen: 1,
                };
                let _ = store.insert_signature(&sig);
            }
        }

        hash
    }

    pub fn on_bt_device(&self, obs: BtObservation) -> String {
        let mac = normalize_mac(&obs.mac);
        let timestamp = obs.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let mut inner = self.inner.lock().unwrap();

        if is_randomized_mac(&mac) {
            inner.stats.randomized_macs_detected += 1;
        }

        let profile = inner
            .bt_profiles
            .entry(mac.clone())
            .or_insert_with(|| BtProfile::new(mac.clone(), obs.first_time.unwrap_or(timestamp)));
        profile.record(obs.name.as_deref(), obs.rssi, timestamp);
        let first_seen = profile.first_seen;
        let last_seen = profile.last_seen;

        let features = BtFeatures::from_observation(&obs);
        let hash = features.hash();
        let trackable = bt::is_trackable(&mac, obs.is_ble, obs.is_classic);

        inner.stats.bt_fingerprints += 1;
        inner.stats.bt_cache_size = inner.bt_profiles.len();

        let signature_data = serde_json::to_value(&features).unwrap_or_default();
        for cb in &inner.signature_callbacks {
            cb("bt", &hash, &signature_data);
        }

        let session_id = inner.session_id.clone();
        drop(inner);

        if self.auto_store {
            if let (Some(store), Some(session_id)) = (&self.store, session_id) {
                let (lat, lon, alt, gps_valid) = self.current_geo();
                let device_type = if obs.is_ble && obs.is_classic {
                    "dual"
                } else if obs.is_ble {
                    "ble"
                } else if obs.is_classic {
                    "classic"
                } else {
                    "unknown"
                };
                let device = StoreBtDevice {
                    device_key: obs.device_key.clone().unwrap_or_else(|| mac.clone()),
                    mac: mac.clone(),
                    name: obs.name.clone(),
                    device_type: device_type.to_string(),
                    device_class: obs.device_class.map(|c| bt::decode_device_class(c)),
                    rssi: obs.rssi,
                    manuf: obs.manuf.clone().or_else(|| oui::lookup_vendor(&mac).map(|v| v.to_string())),
                    service_uuids: features.service_uuids.clone(),
                    first_seen,
                    last_seen,
                    lat,
                    lon,
                    alt,
                    gps_valid,
                    fingerprint_hash: Some(hash.clone()),
                    is_known: trackable,
                    identified_as: None,
                    is_duplicate: false,
                    duplicate_of_id: None,
                    seen_by_nodes: Vec::new(),
                };
                if let Err(e) = store.insert_bt_device(&session_id, &device) {
                    debug!("failed to submit bt fingerprint to store: {e}");
                }
                let sig = FingerprintSignature {
                    fingerprint_hash: hash.clone(),
                    device_type: "bt".to_string(),
                    model: None,
                    os_version: None,
                    confidence: 0.0,
                    identifiers: None,
                    first_seen,
                    times_seen: 1,
                };
                let _ = store.insert_signature(&sig);
            }
        }

        hash
    }

    /// Dispatches an upstream record to `on_wifi_probe`/`on_bt_device` by
    /// type; unknown-type records are counted but never fingerprinted
    /// (no stable feature vector is defined for them). The daemon's own
    /// `kismet.device.base.key` carries through as `device_key` so the
    /// store upsert merges on the same identity the daemon uses, rather
    /// than falling back to the MAC.
    pub fn on_external_device(&self, record: &UpstreamDevice) -> Option<String> {
        match record {
            UpstreamDevice::Wifi(w) => {
                if !w.probed_ssids.is_empty() {
                    self.seed_probed_ssids(&w.bssid, &w.probed_ssids, w.last_time);
                }
                Some(self.on_wifi_probe(WifiObservation {
                    mac: w.bssid.clone(),
                    ssid: w.essid.clone(),
                    rssi: w.signal_dbm,
                    rates: Vec::new(),
                    ht_supported: false,
                    ht_caps: 0,
                    vht_supported: false,
                    vht_caps: 0,
                    he_supported: false,
                    vendor_ies: Vec::new(),
                    channel: w.channel,
                    timestamp: Some(w.last_time),
                    device_key: w.key.clone(),
                    manuf: w.manuf.clone(),
                    frequency: w.frequency,
                    first_time: w.first_time,
                }))
            }
            UpstreamDevice::Bt(b) => Some(self.on_bt_device(BtObservation {
                mac: b.mac.clone(),
                name: b.name.clone(),
                rssi: b.rssi,
                device_class: None,
                service_uuids: Vec::new(),
                is_ble: b.bt_type == "ble",
                is_classic: b.bt_type == "classic",
                manufacturer_id: None,
                tx_power: None,
                timestamp: Some(b.last_time),
                device_key: b.key.clone(),
                manuf: b.manuf.clone(),
                first_time: b.first_time,
            })),
            UpstreamDevice::Unknown => {
                let mut inner = self.inner.lock().unwrap();
                inner.stats.wifi_cache_size = inner.wifi_profiles.len();
                None
            }
        }
    }

    /// Folds SSIDs the upstream daemon has already correlated for a MAC
    /// (`dot11.device.probed_ssid_map`) into its profile ahead of the
    /// next hash computation, without itself emitting a fingerprint.
    fn seed_probed_ssids(&self, mac: &str, ssids: &[String], timestamp: i64) {
        let mac = normalize_mac(mac);
        let mut inner = self.inner.lock().unwrap();
        let profile = inner
            .wifi_profiles
            .entry(mac.clone())
            .or_insert_with(|| ProbeProfile::new(mac.clone(), timestamp));
        for ssid in ssids {
            if !ssid.is_empty() {
                profile.probed_ssids.insert(ssid.clone());
            }
        }
    }

    pub fn stats(&self) -> FingerprintStats {
        self.inner.lock().unwrap().stats.clone()
    }

    pub fn clear_cache(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.wifi_profiles.clear();
        inner.bt_profiles.clear();
    }

    /// Groups every probed MAC with a locally-administered (randomized)
    /// address by its most recent fingerprint hash. A single group with
    /// more than one MAC is the signal that those addresses likely
    /// belong to one physical radio cycling its MAC (§8 scenario 5);
    /// cross-session identity resolution beyond this hash equality is
    /// out of scope (§1).
    pub fn correlate_randomized(&self) -> HashMap<String, Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for (mac, profile) in &inner.wifi_profiles {
            if !is_randomized_mac(mac) {
                continue;
            }
            if let Some(hash) = &profile.last_hash {
                groups.entry(hash.clone()).or_default().push(mac.clone());
            }
        }
        for macs in groups.values_mut() {
            macs.sort();
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wifi::VendorIe;

    fn wifi_obs(mac: &str, ssid: &str) -> WifiObservation {
        WifiObservation {
            mac: mac.to_string(),
            ssid: Some(ssid.to_string()),
            rssi: Some(-50),
            rates: vec![6, 12, 24, 54],
            ht_supported: false,
            ht_caps: 0,
            vht_supported: false,
            vht_caps: 0,
            he_supported: false,
            vendor_ies: vec![VendorIe { oui: "001122".to_string(), vendor_type: 1 }],
            channel: Some(6),
            timestamp: Some(1_700_000_000),
        }
    }

    #[test]
    fn on_wifi_probe_returns_64_char_hash_and_updates_stats() {
        let engine = FingerprintEngine::new(None, None, false);
        let hash = engine.on_wifi_probe(wifi_obs("AA:BB:CC:DD:EE:FF", "HomeNet"));
        assert_eq!(hash.len(), 64);
        assert_eq!(engine.stats().wifi_fingerprints, 1);
        assert_eq!(engine.stats().wifi_cache_size, 1);
    }

    #[test]
    fn randomized_mac_counted_without_affecting_hash() {
        let engine = FingerprintEngine::new(None, None, false);
        let a = engine.on_wifi_probe(wifi_obs("02:BB:CC:DD:EE:FF", "Net"));
        let b = engine.on_wifi_probe(wifi_obs("00:BB:CC:DD:EE:FF", "Net"));
        assert_eq!(a, b);
        assert_eq!(engine.stats().randomized_macs_detected, 1);
    }

    #[test]
    fn correlate_randomized_groups_identical_profiles_by_hash() {
        let engine = FingerprintEngine::new(None, None, false);
        let identical = |mac: &str| {
            let mut o = wifi_obs(mac, "SameNet");
            o.vendor_ies.clear();
            o
        };
        engine.on_wifi_probe(identical("02:AA:BB:CC:DD:01"));
        engine.on_wifi_probe(identical("02:AA:BB:CC:DD:02"));
        engine.on_wifi_probe(identical("FA:BB:CC:DD:EE:03"));

        let groups = engine.correlate_randomized();
        assert_eq!(groups.len(), 1);
        let (_, macs) = groups.into_iter().next().unwrap();
        assert_eq!(macs.len(), 3);
        assert!(macs.contains(&"02:AA:BB:CC:DD:01".to_string()));
        assert!(macs.contains(&"02:AA:BB:CC:DD:02".to_string()));
        assert!(macs.contains(&"FA:BB:CC:DD:EE:03".to_string()));
    }

    #[test]
    fn on_bt_device_marks_ble_randomized_as_not_known() {
        let engine = FingerprintEngine::new(None, None, false);
        let hash = engine.on_bt_device(BtObservation {
            mac: "02:11:22:33:44:55".to_string(),
            name: Some("Widget".to_string()),
            rssi: Some(-70),
            device_class: Some(0x0408),
            service_uuids: vec!["180d".to_string()],
            is_ble: true,
            is_classic: false,
            manufacturer_id: None,
            tx_power: None,
            timestamp: Some(1_700_000_000),
            device_key: None,
            manuf: None,
            first_time: None,
        });
        assert_eq!(hash.len(), 64);
        assert_eq!(engine.stats().bt_fingerprints, 1);
    }

    #[test]
    fn external_device_seeds_probed_ssid_map_into_hash() {
        use crate::poller::{UpstreamDevice, WifiRecord};
        let engine = FingerprintEngine::new(None, None, false);
        let without_probes = UpstreamDevice::Wifi(WifiRecord {
            key: Some("KISMET-KEY-1".to_string()),
            bssid: "AA:BB:CC:DD:EE:FF".to_string(),
            essid: Some("HomeNet".to_string()),
            signal_dbm: Some(-50),
            channel: Some(6),
            frequency: Some(2437),
            manuf: Some("Acme".to_string()),
            probed_ssids: Vec::new(),
            first_time: Some(1_699_000_000),
            last_time: 1_700_000_000,
        });
        let hash_before = engine.on_external_device(&without_probes).unwrap();

        let engine2 = FingerprintEngine::new(None, None, false);
        let with_probes = UpstreamDevice::Wifi(WifiRecord {
            probed_ssids: vec!["ProbedNet".to_string()],
            ..match &without_probes {
                UpstreamDevice::Wifi(w) => w.clone(),
                _ => unreachable!(),
            }
        });
        let hash_after = engine2.on_external_device(&with_probes).unwrap();

        assert_ne!(hash_before, hash_after);
    }
}
