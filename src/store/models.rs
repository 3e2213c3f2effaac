//! Row types persisted by the Store, one per entity in the data model.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => SessionStatus::Running,
            "stopping" => SessionStatus::Stopping,
            "stopped" => SessionStatus::Stopped,
            "error" => SessionStatus::Error,
            _ => SessionStatus::Starting,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanSession {
    pub session_id: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub status: SessionStatus,
    pub property_id: Option<String>,
    pub node_id: String,
    pub wifi_count: i64,
    pub bt_count: i64,
}

/// Merge policy for a text field on device upsert: keep the existing
/// value unless the incoming one is present.
#[derive(Debug, Clone, Default)]
pub struct WifiDevice {
    pub device_key: String,
    pub bssid: String,
    pub essid: Option<String>,
    pub device_type: String,
    pub channel: Option<i32>,
    pub frequency: Option<i32>,
    pub signal_dbm: Option<i32>,
    pub encryption: Option<String>,
    pub manuf: Option<String>,
    pub packets_total: i64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub gps_valid: bool,
    pub fingerprint_hash: Option<String>,
    pub fingerprint_data: Option<String>,
    pub is_known: bool,
    pub identified_as: Option<String>,
    pub is_duplicate: bool,
    pub duplicate_of_id: Option<i64>,
    pub seen_by_nodes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BtDevice {
    pub device_key: String,
    pub mac: String,
    pub name: Option<String>,
    pub device_type: String,
    pub device_class: Option<String>,
    pub rssi: Option<i32>,
    pub manuf: Option<String>,
    pub service_uuids: Vec<String>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub gps_valid: bool,
    pub fingerprint_hash: Option<String>,
    pub is_known: bool,
    pub identified_as: Option<String>,
    pub is_duplicate: bool,
    pub duplicate_of_id: Option<i64>,
    pub seen_by_nodes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FingerprintSignature {
    pub fingerprint_hash: String,
    pub device_type: String,
    pub model: Option<String>,
    pub os_version: Option<String>,
    pub confidence: f64,
    pub identifiers: Option<String>,
    pub first_seen: i64,
    pub times_seen: i64,
}

#[derive(Debug, Clone)]
pub struct GpsTrackPoint {
    pub session_id: String,
    pub timestamp: i64,
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub hdop: Option<f32>,
    pub satellites: i32,
    pub fix_quality: i32,
}

#[derive(Debug, Clone)]
pub struct PcapFile {
    pub session_id: String,
    pub filename: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub size_bytes: i64,
    pub packet_count: Option<i64>,
    pub encrypted: bool,
}

/// What kind of device record a buffered JSON line reconstitutes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedKind {
    Wifi,
    Bt,
}

impl BufferedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferedKind::Wifi => "wifi",
            BufferedKind::Bt => "bt",
        }
    }
}
