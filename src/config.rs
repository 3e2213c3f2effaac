use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub database: DatabaseConfig,
    pub gps: GpsConfig,
    pub kismet: KismetConfig,
    pub capture: CaptureConfig,
    pub channel_hopping: ChannelHoppingConfig,
    pub power: PowerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub node_id: String,
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    #[serde(default)]
    pub encryption_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default = "default_min_hdop")]
    pub min_hdop: f32,
    #[serde(default = "default_min_satellites")]
    pub min_satellites: u32,
    #[serde(default)]
    pub wait_for_fix: bool,
    #[serde(default = "default_fix_timeout")]
    pub fix_timeout: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KismetConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub interface: String,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u32,
    #[serde(default = "default_files_to_keep")]
    pub files_to_keep: u32,
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHoppingConfig {
    #[serde(default = "default_hop_mode")]
    pub default_mode: String,
    #[serde(default = "default_fast_rate")]
    pub fast_rate: f64,
    #[serde(default = "default_slow_rate")]
    pub slow_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    #[serde(default)]
    pub monitor_enabled: bool,
    #[serde(default = "default_voltage_source")]
    pub voltage_source: String,
    #[serde(default = "default_warn")]
    pub warn: f32,
    #[serde(default = "default_critical")]
    pub critical: f32,
    #[serde(default = "default_shutdown")]
    pub shutdown: f32,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_backup_dir() -> String {
    "${data_dir}/buffer".to_string()
}
fn default_poll_interval() -> f64 {
    2.0
}
fn default_min_hdop() -> f32 {
    5.0
}
fn default_min_satellites() -> u32 {
    4
}
fn default_fix_timeout() -> f64 {
    30.0
}
fn default_true() -> bool {
    true
}
fn default_max_file_size_mb() -> u32 {
    50
}
fn default_files_to_keep() -> u32 {
    10
}
fn default_hop_mode() -> String {
    "adaptive".to_string()
}
fn default_fast_rate() -> f64 {
    5.0
}
fn default_slow_rate() -> f64 {
    1.0
}
fn default_voltage_source() -> String {
    "sysfs".to_string()
}
fn default_warn() -> f32 {
    3.5
}
fn default_critical() -> f32 {
    3.3
}
fn default_shutdown() -> f32 {
    3.1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;

        let mut config: Config =
            serde_json::from_str(&content).with_context(|| "failed to parse config file")?;
        config.expand_variables();
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Replace `${data_dir}` in nested path-like fields with the resolved
    /// `general.data_dir` value.
    fn expand_variables(&mut self) {
        let data_dir = self.general.data_dir.clone();
        self.general.backup_dir = expand(&self.general.backup_dir, &data_dir);
        self.database.path = expand(&self.database.path, &data_dir);
    }

    pub fn default_config() -> Self {
        Config {
            general: GeneralConfig {
                node_id: "airdump-01".to_string(),
                data_dir: "/var/lib/airdump".to_string(),
                log_level: default_log_level(),
                backup_dir: default_backup_dir(),
            },
            database: DatabaseConfig {
                path: "${data_dir}/database/airdump.db".to_string(),
                encryption_enabled: false,
            },
            gps: GpsConfig {
                enabled: true,
                host: "localhost".to_string(),
                port: 2947,
                poll_interval: default_poll_interval(),
                min_hdop: default_min_hdop(),
                min_satellites: default_min_satellites(),
                wait_for_fix: false,
                fix_timeout: default_fix_timeout(),
            },
            kismet: KismetConfig {
                host: "localhost".to_string(),
                port: 2501,
                user: None,
                pass: None,
                poll_interval: default_poll_interval(),
            },
            capture: CaptureConfig {
                enabled: true,
                interface: "wlan1mon".to_string(),
                max_file_size_mb: default_max_file_size_mb(),
                files_to_keep: default_files_to_keep(),
                filter: None,
            },
            channel_hopping: ChannelHoppingConfig {
                default_mode: default_hop_mode(),
                fast_rate: default_fast_rate(),
                slow_rate: default_slow_rate(),
            },
            power: PowerConfig {
                monitor_enabled: false,
                voltage_source: default_voltage_source(),
                warn: default_warn(),
                critical: default_critical(),
                shutdown: default_shutdown(),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

fn expand(value: &str, data_dir: &str) -> String {
    value.replace("${data_dir}", data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_data_dir_in_nested_paths() {
        let mut cfg = Config::default_config();
        cfg.general.data_dir = "/mnt/flight".to_string();
        cfg.expand_variables();
        assert_eq!(cfg.database.path, "/mnt/flight/database/airdump.db");
        assert_eq!(cfg.general.backup_dir, "/mnt/flight/buffer");
    }

    #[test]
    fn round_trips_through_json() -> Result<()> {
        let cfg = Config::default_config();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        cfg.save(&path)?;
        let loaded = Config::load(&path)?;
        assert_eq!(loaded.general.node_id, cfg.general.node_id);
        Ok(())
    }
}
