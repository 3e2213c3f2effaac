//! Upstream Device Poller: a REST client against a Kismet-style capture
//! daemon. Polls incrementally (`since_ts`), normalizes raw device JSON
//! into the tagged [`UpstreamDevice`] union, and doubles as the
//! [`crate::channels::HopControl`] implementation the Channel-Hop Policy
//! drives.

use crate::channels::HopControl;
use crate::config::KismetConfig;
use crate::error::AirdumpError;
use anyhow::{Context, Result};
use log::{debug, warn};
use reqwest::blocking::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct WifiRecord {
    /// `kismet.device.base.key`: the per-session key the daemon itself
    /// assigns, used as the store's merge key in place of the MAC.
    pub key: Option<String>,
    pub bssid: String,
    pub essid: Option<String>,
    pub signal_dbm: Option<i32>,
    pub channel: Option<u32>,
    pub frequency: Option<u32>,
    pub manuf: Option<String>,
    /// SSIDs from `dot11.device.probed_ssid_map` the daemon has already
    /// correlated for this device.
    pub probed_ssids: Vec<String>,
    pub first_time: Option<i64>,
    pub last_time: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BtRecord {
    /// `kismet.device.base.key`: the per-session key the daemon itself
    /// assigns, used as the store's merge key in place of the MAC.
    pub key: Option<String>,
    pub mac: String,
    pub name: Option<String>,
    pub rssi: Option<i32>,
    pub manuf: Option<String>,
    pub first_time: Option<i64>,
    /// `"ble"` or `"classic"`; anything else is treated as neither.
    pub bt_type: String,
    pub last_time: i64,
}

#[derive(Debug, Clone)]
pub enum UpstreamDevice {
    Wifi(WifiRecord),
    Bt(BtRecord),
    Unknown,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCount {
    pub wifi: u64,
    pub bluetooth: u64,
    pub total: u64,
}

type DeviceCallback = Box<dyn Fn(&UpstreamDevice) + Send>;

struct Callbacks {
    on_new: Vec<DeviceCallback>,
    on_update: Vec<DeviceCallback>,
}

pub struct UpstreamPoller {
    client: Client,
    base_url: String,
    user: Option<String>,
    pass: Option<String>,
    since_ts: AtomicI64,
    running: AtomicBool,
    seen: Mutex<HashMap<String, ()>>,
    counts: Mutex<DeviceCount>,
    callbacks: Mutex<Callbacks>,
}

impl UpstreamPoller {
    pub fn new(config: &KismetConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build kismet http client")?;
        Ok(UpstreamPoller {
            client,
            base_url: format!("http://{}:{}", config.host, config.port),
            user: config.user.clone(),
            pass: config.pass.clone(),
            since_ts: AtomicI64::new(0),
            running: AtomicBool::new(false),
            seen: Mutex::new(HashMap::new()),
            counts: Mutex::new(DeviceCount::default()),
            callbacks: Mutex::new(Callbacks {
                on_new: Vec::new(),
                on_update: Vec::new(),
            }),
        })
    }

    fn request(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.get(&url);
        if let (Some(user), Some(pass)) = (&self.user, &self.pass) {
            req = req.basic_auth(user, Some(pass));
        }
        req
    }

    /// Cheap reachability probe; never advances `since_ts`.
    pub fn check_connection(&self) -> Result<(), AirdumpError> {
        self.request("/system/status.json")
            .send()
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(|e| AirdumpError::UpstreamUnreachable(e.to_string()))
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn on_new(&self, cb: DeviceCallback) {
        self.callbacks.lock().unwrap().on_new.push(cb);
    }

    pub fn on_update(&self, cb: DeviceCallback) {
        self.callbacks.lock().unwrap().on_update.push(cb);
    }

    pub fn count(&self) -> DeviceCount {
        *self.counts.lock().unwrap()
    }

    /// Fetches and parses devices since the last successful poll,
    /// dispatching new/update callbacks and advancing `since_ts` only
    /// once the response has been fully parsed. Transport and HTTP
    /// errors never advance the cursor, so the next poll re-requests the
    /// same window. `since_ts` is omitted from the request body on the
    /// first call, per §4.2.
    pub fn poll(&self) -> Result<Vec<UpstreamDevice>> {
        let since = self.since_ts.load(Ordering::SeqCst);
        let mut body = serde_json::json!({
            "fields": [
                "kismet.device.base.type",
                "kismet.device.base.macaddr",
                "kismet.device.base.commonname",
                "kismet.device.base.channel",
                "kismet.device.base.frequency",
                "kismet.device.base.signal",
                "kismet.device.base.manuf",
                "kismet.device.base.key",
                "kismet.device.base.first_time",
                "kismet.device.base.last_time",
                "dot11.device.last_ssid",
                "dot11.device.last_beaconed_ssid",
                "dot11.device.probed_ssid_map",
            ],
        });
        if since > 0 {
            body["last_time"] = serde_json::json!(since);
        }

        let url = format!("{}/devices/views/all/devices.json", self.base_url);
        let mut req = self.client.post(&url).json(&body);
        if let (Some(user), Some(pass)) = (&self.user, &self.pass) {
            req = req.basic_auth(user, Some(pass));
        }
        let resp = req
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| AirdumpError::UpstreamUnreachable(e.to_string()))?;

        let body: Value = resp
            .json()
            .map_err(|e| AirdumpError::UpstreamUnreachable(e.to_string()))?;

        let raw_devices = body.as_array().cloned().unwrap_or_default();
        let mut devices = Vec::with_capacity(raw_devices.len());
        let mut counts = self.counts.lock().unwrap();
        let mut seen = self.seen.lock().unwrap();
        let mut callbacks_new = Vec::new();
        let mut callbacks_update = Vec::new();

        for raw in &raw_devices {
            let device = parse_device(raw);
            let key = device_key(&device);

            match &device {
                UpstreamDevice::Wifi(_) => counts.wifi += 1,
                UpstreamDevice::Bt(_) => counts.bluetooth += 1,
                UpstreamDevice::Unknown => {}
            }
            counts.total += 1;

            if let Some(key) = key {
                if seen.insert(key, ()).is_some() {
                    callbacks_update.push(device.clone());
                } else {
                    callbacks_new.push(device.clone());
                }
            }
            devices.push(device);
        }
        drop(seen);
        drop(counts);

        let cbs = self.callbacks.lock().unwrap();
        for d in &callbacks_new {
            for cb in &cbs.on_new {
                cb(d);
            }
        }
        for d in &callbacks_update {
            for cb in &cbs.on_update {
                cb(d);
            }
        }
        drop(cbs);

        self.since_ts
            .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
        debug!("polled {} upstream devices", devices.len());
        Ok(devices)
    }
}

/// The identity used to dedupe new-vs-update in the `seen` set. Prefers
/// the daemon-assigned `kismet.device.base.key`, falling back to the MAC
/// only when the daemon didn't report one.
fn device_key(device: &UpstreamDevice) -> Option<String> {
    match device {
        UpstreamDevice::Wifi(w) => w.key.clone().or_else(|| (!w.bssid.is_empty()).then(|| w.bssid.clone())),
        UpstreamDevice::Bt(b) => b.key.clone().or_else(|| (!b.mac.is_empty()).then(|| b.mac.clone())),
        _ => None,
    }
}

/// Maps a raw Kismet device JSON object into an [`UpstreamDevice`].
///
/// Type classification follows `kismet.device.base.type`: `"Wi-Fi
/// Device"`/`"Wi-Fi AP"`/`"Wi-Fi Client"` -> Wi-Fi; `"BR/EDR"` ->
/// Bluetooth classic; `"BTLE"` -> Bluetooth BLE; anything else ->
/// Unknown. When both `bssid`/`mac` or `essid`/`ssid` are present for a
/// device, the Wi-Fi-specific field name wins.
fn parse_device(raw: &Value) -> UpstreamDevice {
    let device_type = raw
        .get("kismet.device.base.type")
        .and_then(Value::as_str)
        .unwrap_or("");
    let last_time = raw
        .get("kismet.device.base.last_time")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    let first_time = raw.get("kismet.device.base.first_time").and_then(Value::as_i64);
    let key = raw
        .get("kismet.device.base.key")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let manuf = raw
        .get("kismet.device.base.manuf")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    match device_type {
        "Wi-Fi Device" | "Wi-Fi AP" | "Wi-Fi Client" => {
            let bssid = raw
                .get("kismet.device.base.macaddr")
                .or_else(|| raw.get("bssid"))
                .or_else(|| raw.get("mac"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let essid = raw
                .get("dot11.device.last_beaconed_ssid")
                .or_else(|| raw.get("dot11.device.last_ssid"))
                .or_else(|| raw.get("essid"))
                .or_else(|| raw.get("ssid"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let signal_dbm = raw
                .get("kismet.device.base.signal")
                .and_then(|s| s.get("kismet.common.signal.last_signal"))
                .and_then(Value::as_i64)
                .map(|v| v as i32);
            let channel = raw
                .get("kismet.device.base.channel")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<u32>().ok());
            let frequency = raw
                .get("kismet.device.base.frequency")
                .and_then(Value::as_f64)
                .map(|f| f as u32);
            let probed_ssids = raw
                .get("dot11.device.probed_ssid_map")
                .and_then(Value::as_object)
                .map(|m| {
                    m.values()
                        .filter_map(|v| {
                            v.get("dot11.probedssid.ssid")
                                .and_then(Value::as_str)
                                .or_else(|| v.as_str())
                        })
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            UpstreamDevice::Wifi(WifiRecord {
                key,
                bssid,
                essid,
                signal_dbm,
                channel,
                frequency,
                manuf,
                probed_ssids,
                first_time,
                last_time,
            })
        }
        "BR/EDR" | "BTLE" => {
            let mac = raw
                .get("kismet.device.base.macaddr")
                .or_else(|| raw.get("mac"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let name = raw
                .get("kismet.device.base.commonname")
                .or_else(|| raw.get("name"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let rssi = raw
                .get("kismet.device.base.signal")
                .and_then(|s| s.get("kismet.common.signal.last_signal"))
                .and_then(Value::as_i64)
                .map(|v| v as i32);
            let bt_type = if device_type == "BTLE" { "ble" } else { "classic" }.to_string();

            UpstreamDevice::Bt(BtRecord {
                key,
                mac,
                name,
                rssi,
                manuf,
                first_time,
                bt_type,
                last_time,
            })
        }
        _ => UpstreamDevice::Unknown,
    }
}

impl HopControl for UpstreamPoller {
    fn set_hop_channels(&self, source_id: &str, channels: &[u32], rate: f64) -> Result<()> {
        let url = format!(
            "{}/datasource/by-uuid/{}/set_hop.cmd",
            self.base_url, source_id
        );
        let body = serde_json::json!({
            "channels": channels,
            "rate": rate,
        });
        self.post_cmd(&url, &body)
    }

    fn set_channel(&self, source_id: &str, channel: u32) -> Result<()> {
        let url = format!(
            "{}/datasource/by-uuid/{}/set_channel.cmd",
            self.base_url, source_id
        );
        let body = serde_json::json!({ "channel": channel.to_string() });
        self.post_cmd(&url, &body)
    }

    fn disable_hop(&self, source_id: &str) -> Result<()> {
        let url = format!(
            "{}/datasource/by-uuid/{}/set_hop.cmd",
            self.base_url, source_id
        );
        let body = serde_json::json!({ "hop": false });
        self.post_cmd(&url, &body)
    }
}

impl UpstreamPoller {
    fn post_cmd(&self, url: &str, body: &Value) -> Result<()> {
        let mut req = self.client.post(url).json(body);
        if let (Some(user), Some(pass)) = (&self.user, &self.pass) {
            req = req.basic_auth(user, Some(pass));
        }
        req.send()
            .and_then(|r| r.error_for_status())
            .map(|_| ())
            .map_err(|e| {
                warn!("kismet control request to {url} failed: {e}");
                anyhow::anyhow!("kismet control request failed: {e}")
            })
    }

    /// Lists available capture sources, for auto-binding the Channel-Hop
    /// Policy to the first Wi-Fi source at startup.
    pub fn datasources(&self) -> Result<Vec<String>> {
        let resp = self
            .request("/datasource/all_sources.json")
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| AirdumpError::UpstreamUnreachable(e.to_string()))?;
        let body: Value = resp
            .json()
            .map_err(|e| AirdumpError::UpstreamUnreachable(e.to_string()))?;
        let ids = body
            .as_array()
            .map(|sources| {
                sources
                    .iter()
                    .filter_map(|s| s.get("kismet.datasource.uuid").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wifi_device_type_classification() {
        let raw = serde_json::json!({
            "kismet.device.base.type": "Wi-Fi AP",
            "kismet.device.base.macaddr": "AA:BB:CC:DD:EE:FF",
            "dot11.device.last_ssid": "HomeNet",
            "kismet.device.base.last_time": 1_700_000_000,
        });
        match parse_device(&raw) {
            UpstreamDevice::Wifi(w) => {
                assert_eq!(w.bssid, "AA:BB:CC:DD:EE:FF");
                assert_eq!(w.essid.as_deref(), Some("HomeNet"));
            }
            _ => panic!("expected wifi device"),
        }
    }

    #[test]
    fn btle_maps_to_bluetooth_ble() {
        let raw = serde_json::json!({
            "kismet.device.base.type": "BTLE",
            "kismet.device.base.macaddr": "11:22:33:44:55:66",
            "kismet.device.base.last_time": 1_700_000_000,
        });
        match parse_device(&raw) {
            UpstreamDevice::Bt(b) => assert_eq!(b.bt_type, "ble"),
            _ => panic!("expected bt device"),
        }
    }

    #[test]
    fn bredr_maps_to_bluetooth_classic() {
        let raw = serde_json::json!({
            "kismet.device.base.type": "BR/EDR",
            "mac": "11:22:33:44:55:66",
            "kismet.device.base.last_time": 1_700_000_000,
        });
        match parse_device(&raw) {
            UpstreamDevice::Bt(b) => assert_eq!(b.bt_type, "classic"),
            _ => panic!("expected bt device"),
        }
    }

    #[test]
    fn unrecognized_type_is_unknown() {
        let raw = serde_json::json!({ "kismet.device.base.type": "Zigbee Device" });
        assert!(matches!(parse_device(&raw), UpstreamDevice::Unknown));
    }

    #[test]
    fn bssid_field_preferred_over_mac_when_both_present() {
        let raw = serde_json::json!({
            "kismet.device.base.type": "Wi-Fi Client",
            "bssid": "AA:AA:AA:AA:AA:AA",
            "mac": "BB:BB:BB:BB:BB:BB",
            "kismet.device.base.last_time": 1,
        });
        match parse_device(&raw) {
            UpstreamDevice::Wifi(w) => assert_eq!(w.bssid, "AA:AA:AA:AA:AA:AA"),
            _ => panic!("expected wifi device"),
        }
    }

    #[test]
    fn wifi_device_carries_daemon_key_and_supplemental_fields() {
        let raw = serde_json::json!({
            "kismet.device.base.type": "Wi-Fi AP",
            "kismet.device.base.macaddr": "AA:BB:CC:DD:EE:FF",
            "kismet.device.base.key": "KISMET-DEVKEY-42",
            "kismet.device.base.first_time": 1_699_000_000,
            "kismet.device.base.last_time": 1_700_000_000,
            "kismet.device.base.frequency": 2437.0,
            "kismet.device.base.manuf": "Acme Corp",
            "dot11.device.last_beaconed_ssid": "HomeNet-AP",
            "dot11.device.last_ssid": "stale-client-probe-name",
            "dot11.device.probed_ssid_map": {
                "h1": { "dot11.probedssid.ssid": "ProbedOne" },
                "h2": "ProbedTwo",
            },
        });
        match parse_device(&raw) {
            UpstreamDevice::Wifi(w) => {
                assert_eq!(w.key.as_deref(), Some("KISMET-DEVKEY-42"));
                assert_eq!(w.first_time, Some(1_699_000_000));
                assert_eq!(w.frequency, Some(2437));
                assert_eq!(w.manuf.as_deref(), Some("Acme Corp"));
                assert_eq!(w.essid.as_deref(), Some("HomeNet-AP"));
                assert_eq!(w.probed_ssids.len(), 2);
                assert!(w.probed_ssids.contains(&"ProbedOne".to_string()));
                assert!(w.probed_ssids.contains(&"ProbedTwo".to_string()));
            }
            _ => panic!("expected wifi device"),
        }
    }

    #[test]
    fn device_key_prefers_daemon_key_over_bssid() {
        let wifi = UpstreamDevice::Wifi(WifiRecord {
            key: Some("KISMET-DEVKEY-1".to_string()),
            bssid: "AA:BB:CC:DD:EE:FF".to_string(),
            ..Default::default()
        });
        assert_eq!(device_key(&wifi), Some("KISMET-DEVKEY-1".to_string()));

        let wifi_no_key = UpstreamDevice::Wifi(WifiRecord {
            bssid: "AA:BB:CC:DD:EE:FF".to_string(),
            ..Default::default()
        });
        assert_eq!(device_key(&wifi_no_key), Some("AA:BB:CC:DD:EE:FF".to_string()));
    }
}
