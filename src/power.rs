//! Power Monitor: samples drone battery voltage through a pluggable
//! source, classifies it against configured thresholds, and estimates
//! remaining runtime from a short linear trend.

use crate::config::PowerConfig;
use log::{info, warn};
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const HISTORY_SIZE: usize = 100;
const TREND_WINDOW: usize = 10;
/// Fallback reading when a source can't be read at all; treated as
/// "unknown, assume ok" rather than a fault.
const UNKNOWN_VOLTAGE: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Ok,
    Warning,
    Critical,
    Shutdown,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Ok => "ok",
            PowerState::Warning => "warning",
            PowerState::Critical => "critical",
            PowerState::Shutdown => "shutdown",
        }
    }
}

pub trait VoltageSource: Send + Sync {
    /// Reads the current battery voltage; falls back to
    /// [`UNKNOWN_VOLTAGE`] when the underlying source can't be read.
    fn read(&self) -> f32;
}

/// Scans `/sys/class/power_supply/*/voltage_now` (microvolts).
pub struct SysfsVoltageSource;

impl VoltageSource for SysfsVoltageSource {
    fn read(&self) -> f32 {
        let Ok(entries) = fs::read_dir("/sys/class/power_supply") else {
            return UNKNOWN_VOLTAGE;
        };
        for entry in entries.flatten() {
            let path = entry.path().join("voltage_now");
            if let Ok(contents) = fs::read_to_string(&path) {
                if let Ok(microvolts) = contents.trim().parse::<f64>() {
                    return (microvolts / 1_000_000.0) as f32;
                }
            }
        }
        UNKNOWN_VOLTAGE
    }
}

/// ADC-backed source. No fabricated hardware dependency is wired up, so
/// this reports the unknown fallback until a platform-specific backend
/// is added.
pub struct AdcVoltageSource;

impl VoltageSource for AdcVoltageSource {
    fn read(&self) -> f32 {
        UNKNOWN_VOLTAGE
    }
}

/// I2C fuel-gauge source, same fallback rationale as [`AdcVoltageSource`].
pub struct I2cVoltageSource;

impl VoltageSource for I2cVoltageSource {
    fn read(&self) -> f32 {
        UNKNOWN_VOLTAGE
    }
}

pub fn voltage_source_for(name: &str) -> Box<dyn VoltageSource> {
    match name {
        "adc" => Box::new(AdcVoltageSource),
        "i2c" => Box::new(I2cVoltageSource),
        _ => Box::new(SysfsVoltageSource),
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    voltage: f32,
    timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PowerStats {
    pub voltage: f32,
    pub remaining_minutes: Option<f64>,
    pub sample_count: usize,
}

type StateCallback = Box<dyn Fn(PowerState, f32) + Send>;

struct Inner {
    history: VecDeque<Sample>,
    state: PowerState,
}

pub struct PowerMonitor {
    source: Box<dyn VoltageSource>,
    warn: f32,
    critical: f32,
    shutdown: f32,
    inner: Mutex<Inner>,
    callbacks: Mutex<Vec<StateCallback>>,
    enabled: AtomicBool,
}

impl PowerMonitor {
    pub fn new(config: &PowerConfig) -> Self {
        PowerMonitor {
            source: voltage_source_for(&config.voltage_source),
            warn: config.warn,
            critical: config.critical,
            shutdown: config.shutdown,
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(HISTORY_SIZE),
                state: PowerState::Ok,
            }),
            callbacks: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(config.monitor_enabled),
        }
    }

    pub fn on_state_change(&self, cb: StateCallback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Classifies a voltage into a state. Readings exactly at a
    /// threshold resolve to the worse state, so thresholds act as hard
    /// floors rather than open bounds.
    fn classify(&self, voltage: f32) -> PowerState {
        if voltage <= self.shutdown {
            PowerState::Shutdown
        } else if voltage <= self.critical {
            PowerState::Critical
        } else if voltage <= self.warn {
            PowerState::Warning
        } else {
            PowerState::Ok
        }
    }

    /// Reads the source once, records it, classifies it, and fires
    /// callbacks. The shutdown callback fires on every sample while the
    /// state remains shutdown; other states only fire on transition.
    pub fn sample(&self) -> PowerState {
        let voltage = self.source.read();
        let timestamp = chrono::Utc::now().timestamp();
        let new_state = self.classify(voltage);

        let mut inner = self.inner.lock().unwrap();
        if inner.history.len() >= HISTORY_SIZE {
            inner.history.pop_front();
        }
        inner.history.push_back(Sample { voltage, timestamp });
        let prev_state = inner.state;
        inner.state = new_state;
        drop(inner);

        let should_fire = new_state == PowerState::Shutdown || new_state != prev_state;
        if should_fire {
            if new_state != prev_state {
                match new_state {
                    PowerState::Warning => warn!("battery voltage warning: {voltage:.2}V"),
                    PowerState::Critical => warn!("battery voltage critical: {voltage:.2}V"),
                    PowerState::Shutdown => warn!("battery voltage at shutdown threshold: {voltage:.2}V"),
                    PowerState::Ok => info!("battery voltage recovered: {voltage:.2}V"),
                }
            }
            let callbacks = self.callbacks.lock().unwrap();
            for cb in callbacks.iter() {
                cb(new_state, voltage);
            }
        }

        new_state
    }

    pub fn state(&self) -> PowerState {
        self.inner.lock().unwrap().state
    }

    /// Linear fit over the last `TREND_WINDOW` samples: `(last_v -
    /// first_v) / elapsed_minutes` gives V/min; remaining minutes is
    /// `abs(voltage_above_shutdown / trend)` when the trend is
    /// negative. `None` when there isn't enough history or the trend
    /// isn't declining.
    pub fn stats(&self) -> PowerStats {
        let inner = self.inner.lock().unwrap();
        let window: Vec<Sample> = inner
            .history
            .iter()
            .rev()
            .take(TREND_WINDOW)
            .rev()
            .copied()
            .collect();
        let sample_count = inner.history.len();
        let voltage = window.last().map(|s| s.voltage).unwrap_or(UNKNOWN_VOLTAGE);
        drop(inner);

        let remaining_minutes = if window.len() >= 2 {
            let first = window.first().unwrap();
            let last = window.last().unwrap();
            let elapsed_min = (last.timestamp - first.timestamp) as f64 / 60.0;
            if elapsed_min > 0.0 {
                let trend = (last.voltage - first.voltage) as f64 / elapsed_min;
                if trend < 0.0 {
                    let remaining_voltage = (last.voltage - self.shutdown) as f64;
                    Some((remaining_voltage / trend).abs())
                } else {
                    None
                }
            } else {
                None
            }
        } else {
            None
        };

        PowerStats {
            voltage,
            remaining_minutes,
            sample_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn config() -> PowerConfig {
        PowerConfig {
            monitor_enabled: true,
            voltage_source: "sysfs".to_string(),
            warn: 3.5,
            critical: 3.3,
            shutdown: 3.1,
        }
    }

    struct FixedSource(Mutex<f32>);
    impl VoltageSource for FixedSource {
        fn read(&self) -> f32 {
            *self.0.lock().unwrap()
        }
    }

    fn monitor_with(voltage: f32) -> (PowerMonitor, Arc<Mutex<f32>>) {
        let cfg = config();
        let shared = Arc::new(Mutex::new(voltage));
        let source = FixedSource(Mutex::new(voltage));
        let monitor = PowerMonitor {
            source: Box::new(source),
            warn: cfg.warn,
            critical: cfg.critical,
            shutdown: cfg.shutdown,
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(HISTORY_SIZE),
                state: PowerState::Ok,
            }),
            callbacks: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        };
        (monitor, shared)
    }

    #[test]
    fn boundary_voltage_yields_worse_state() {
        let (monitor, _) = monitor_with(3.5);
        assert_eq!(monitor.classify(3.5), PowerState::Warning);
        assert_eq!(monitor.classify(3.3), PowerState::Critical);
        assert_eq!(monitor.classify(3.1), PowerState::Shutdown);
        assert_eq!(monitor.classify(3.6), PowerState::Ok);
    }

    #[test]
    fn history_is_bounded() {
        let (monitor, _) = monitor_with(4.0);
        for _ in 0..(HISTORY_SIZE + 20) {
            monitor.sample();
        }
        assert_eq!(monitor.inner.lock().unwrap().history.len(), HISTORY_SIZE);
    }

    #[test]
    fn shutdown_callback_fires_every_sample_others_only_on_transition() {
        let (monitor, _) = monitor_with(3.0);
        let transitions = Arc::new(AtomicU32::new(0));
        let t = transitions.clone();
        monitor.on_state_change(Box::new(move |_, _| {
            t.fetch_add(1, Ordering::SeqCst);
        }));
        monitor.sample();
        monitor.sample();
        monitor.sample();
        assert_eq!(transitions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ok_state_only_fires_on_entry() {
        let (monitor, _) = monitor_with(4.0);
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        monitor.on_state_change(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        monitor.sample();
        monitor.sample();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
