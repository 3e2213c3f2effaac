//! Packet-capture tool lifecycle: spawns the external rotating-capture
//! process (§6.3) and, optionally, a live line-delimited JSON parser
//! task over its stdout for fine-grained probe-request detail the
//! upstream REST snapshot can't provide at full packet rate (§5.1).

use crate::error::AirdumpError;
use crate::fingerprint::wifi::{VendorIe, WifiObservation};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Consecutive unparseable stdout lines before the degraded-run stat
/// fires; a single malformed line is logged and skipped, not fatal.
const DEGRADED_RUN_THRESHOLD: u32 = 20;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: String,
    pub output_dir: PathBuf,
    pub max_file_size_mb: u32,
    pub files_to_keep: u32,
    pub filter: Option<String>,
}

pub struct CaptureSession {
    pub interface: String,
    pub output_prefix: PathBuf,
    child: Child,
}

/// Spawns the external capture tool (tshark-compatible: `-i`, `-w`,
/// `-F pcapng`, `-b filesize:KB` / `-b files:N`, optional `-f <bpf>`).
pub fn start_capture(session_id: &str, config: &CaptureConfig) -> Result<CaptureSession, AirdumpError> {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_prefix = config
        .output_dir
        .join(format!("airdump_capture_{session_id}_{timestamp}.pcapng"));

    let mut cmd = Command::new("tshark");
    cmd.arg("-i")
        .arg(&config.interface)
        .arg("-w")
        .arg(&output_prefix)
        .arg("-F")
        .arg("pcapng");

    if let Some(filter) = &config.filter {
        cmd.arg("-f").arg(filter);
    }

    cmd.arg("-b")
        .arg(format!("filesize:{}", config.max_file_size_mb * 1024))
        .arg("-b")
        .arg(format!("files:{}", config.files_to_keep));

    cmd.stdout(Stdio::null()).stderr(Stdio::null());

    let child = cmd
        .spawn()
        .map_err(|e| AirdumpError::CaptureSpawnFailure(e.to_string()))?;

    info!("started capture on {} -> {:?}", config.interface, output_prefix);
    Ok(CaptureSession {
        interface: config.interface.clone(),
        output_prefix,
        child,
    })
}

impl CaptureSession {
    /// SIGTERM, wait up to 5s, SIGKILL on timeout. `tokio::process::Child`
    /// has no portable "send arbitrary signal" API, so SIGTERM is sent by
    /// shelling out to `kill` rather than binding to libc directly.
    pub async fn stop(mut self) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .output()
            {
                warn!("failed to send SIGTERM to capture tool (pid {pid}): {e}");
            }
        }

        match timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => debug!("capture tool exited: {status}"),
            Ok(Err(e)) => warn!("error waiting for capture tool: {e}"),
            Err(_) => {
                warn!("capture tool did not exit within 5s, sending SIGKILL");
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LiveParserStats {
    pub lines_parsed: u64,
    pub lines_skipped: u64,
    pub degraded_runs: u64,
}

/// Spawns `tshark -T ek` against the monitor interface and feeds parsed
/// probe-request lines to `on_probe`. Returns immediately; the reader
/// loop runs as a background task until the returned child is dropped
/// or explicitly killed by the orchestrator.
pub struct LivePacketParser {
    child: Option<Child>,
    degraded_counter: Arc<AtomicU32>,
    stats: Arc<std::sync::Mutex<LiveParserStats>>,
}

impl LivePacketParser {
    pub fn start<F>(interface: &str, on_probe: F) -> Result<Self, AirdumpError>
    where
        F: Fn(WifiObservation) + Send + 'static,
    {
        let fields = [
            "frame.time_epoch",
            "wlan.fc.type_subtype",
            "wlan.sa",
            "wlan.ssid",
            "wlan.channel",
            "wlan_radio.signal_dbm",
            "wlan.supported_rates",
            "wlan.ht.capabilities",
        ];

        let mut cmd = Command::new("tshark");
        cmd.arg("-i").arg(interface).arg("-T").arg("ek").arg("-l");
        for f in fields {
            cmd.arg("-e").arg(f);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| AirdumpError::CaptureSpawnFailure(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AirdumpError::CaptureSpawnFailure("no stdout pipe".to_string()))?;

        let degraded_counter = Arc::new(AtomicU32::new(0));
        let stats = Arc::new(std::sync::Mutex::new(LiveParserStats::default()));
        let dc = degraded_counter.clone();
        let st = stats.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match parse_ek_line(&line) {
                            Some(obs) => {
                                dc.store(0, Ordering::SeqCst);
                                st.lock().unwrap().lines_parsed += 1;
                                on_probe(obs);
                            }
                            None => {
                                st.lock().unwrap().lines_skipped += 1;
                                let run = dc.fetch_add(1, Ordering::SeqCst) + 1;
                                if run == DEGRADED_RUN_THRESHOLD {
                                    st.lock().unwrap().degraded_runs += 1;
                                    error!(
                                        "{DEGRADED_RUN_THRESHOLD} consecutive unparseable live-capture lines; upstream format may have changed"
                                    );
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("live capture read error: {e}");
                        break;
                    }
                }
            }
        });

        Ok(LivePacketParser {
            child: Some(child),
            degraded_counter,
            stats,
        })
    }

    pub fn stats(&self) -> LiveParserStats {
        self.stats.lock().unwrap().clone()
    }

    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.degraded_counter.store(0, Ordering::SeqCst);
    }
}

/// Probe requests only: `wlan.fc.type_subtype == "0x04"`. Any missing
/// required field (source MAC) is treated as unparseable rather than
/// defaulted, per §9's degraded-run policy.
fn parse_ek_line(line: &str) -> Option<WifiObservation> {
    let value: Value = serde_json::from_str(line).ok()?;
    let layers = value.get("layers")?;

    let type_subtype = field_str(layers, "wlan_fc_type_subtype")?;
    if type_subtype != "0x04" {
        return None;
    }

    let mac = field_str(layers, "wlan_sa")?;
    let ssid = field_str(layers, "wlan_ssid");
    let channel = field_str(layers, "wlan_channel").and_then(|s| s.parse::<u32>().ok());
    let rssi = field_str(layers, "wlan_radio_signal_dbm").and_then(|s| s.parse::<i32>().ok());
    let timestamp = field_str(layers, "frame_time_epoch")
        .and_then(|s| s.parse::<f64>().ok())
        .map(|f| f as i64);
    let ht_supported = field_str(layers, "wlan_ht_capabilities").is_some();

    let rates: Vec<u32> = field_str(layers, "wlan_supported_rates")
        .map(|s| {
            s.split(',')
                .filter_map(|part| part.trim().parse::<f64>().ok().map(|r| r as u32))
                .collect()
        })
        .unwrap_or_default();

    Some(WifiObservation {
        mac,
        ssid,
        rssi,
        rates,
        ht_supported,
        ht_caps: 0,
        vht_supported: false,
        vht_caps: 0,
        he_supported: false,
        vendor_ies: Vec::<VendorIe>::new(),
        channel,
        timestamp,
        device_key: None,
        manuf: None,
        frequency: None,
        first_time: None,
    })
}

fn field_str(layers: &Value, field: &str) -> Option<String> {
    match layers.get(field) {
        Some(Value::Array(arr)) => arr.first().and_then(Value::as_str).map(str::to_string),
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

pub fn tshark_available() -> bool {
    std::process::Command::new("tshark")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn interface_exists(interface: &str) -> bool {
    Path::new("/sys/class/net").join(interface).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_probe_request_line() {
        let line = r#"{"layers":{"wlan_fc_type_subtype":["0x04"],"wlan_sa":["AA:BB:CC:DD:EE:FF"],"wlan_ssid":["HomeNet"],"wlan_channel":["6"],"wlan_radio_signal_dbm":["-55"],"frame_time_epoch":["1700000000.123"]}}"#;
        let obs = parse_ek_line(line).expect("should parse");
        assert_eq!(obs.mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(obs.ssid.as_deref(), Some("HomeNet"));
        assert_eq!(obs.channel, Some(6));
        assert_eq!(obs.rssi, Some(-55));
    }

    #[test]
    fn non_probe_frame_is_skipped() {
        let line = r#"{"layers":{"wlan_fc_type_subtype":["0x08"],"wlan_sa":["AA:BB:CC:DD:EE:FF"]}}"#;
        assert!(parse_ek_line(line).is_none());
    }

    #[test]
    fn missing_source_mac_is_unparseable() {
        let line = r#"{"layers":{"wlan_fc_type_subtype":["0x04"]}}"#;
        assert!(parse_ek_line(line).is_none());
    }

    #[test]
    fn malformed_json_is_unparseable() {
        assert!(parse_ek_line("not json").is_none());
    }
}
