//! GPS Service: maintains a quality-gated current position and bounded
//! history, fed by gpsd's JSON-lines TPV/SKY stream, and pushes every
//! sample (valid or not) to subscribers.

use crate::config::GpsConfig;
use crate::error::AirdumpError;
use chrono::Utc;
use gpsd_proto::{get_data, Mode, ResponseData, Satellite, ENABLE_WATCH_CMD};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

const HISTORY_SIZE: usize = 100;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsPosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub speed: f64,
    pub heading: f64,
    pub hdop: f32,
    pub fix_quality: u8,
    pub satellites: u32,
    pub valid: bool,
    pub timestamp: i64,
}

impl GpsPosition {
    pub fn invalid() -> Self {
        GpsPosition {
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            speed: 0.0,
            heading: 0.0,
            hdop: 99.0,
            fix_quality: 0,
            satellites: 0,
            valid: false,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// `(lat, lon, alt, ts)`, zeroed when the position isn't valid.
    pub fn to_tuple(&self) -> (f64, f64, f64, i64) {
        if self.valid {
            (self.lat, self.lon, self.alt, self.timestamp)
        } else {
            (0.0, 0.0, 0.0, 0)
        }
    }
}

impl Default for GpsPosition {
    fn default() -> Self {
        Self::invalid()
    }
}

struct SkySnapshot {
    hdop: f32,
    satellites_used: u32,
}

impl Default for SkySnapshot {
    fn default() -> Self {
        SkySnapshot {
            hdop: 99.0,
            satellites_used: 0,
        }
    }
}

pub struct GpsService {
    host: String,
    port: u16,
    min_hdop: f32,
    min_satellites: u32,
    current: Mutex<GpsPosition>,
    history: Mutex<VecDeque<GpsPosition>>,
    tx: broadcast::Sender<GpsPosition>,
    running: Arc<AtomicBool>,
}

impl GpsService {
    pub fn new(config: &GpsConfig) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        GpsService {
            host: config.host.clone(),
            port: config.port,
            min_hdop: config.min_hdop,
            min_satellites: config.min_satellites,
            current: Mutex::new(GpsPosition::invalid()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_SIZE)),
            tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Establish a stream to the gpsd daemon, failing fast if unreachable.
    pub fn connect(&self) -> Result<(), AirdumpError> {
        TcpStream::connect((self.host.as_str(), self.port))
            .map(|_| ())
            .map_err(|e| AirdumpError::GpsUnavailable(e.to_string()))
    }

    /// Spawn the background polling task. Runs until `stop()` is called.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let svc = Arc::clone(self);
        tokio::task::spawn_blocking(move || svc.poll_loop());
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn current(&self) -> GpsPosition {
        *self.current.lock().unwrap()
    }

    pub fn current_tuple(&self) -> (f64, f64, f64, i64) {
        self.current().to_tuple()
    }

    pub fn has_fix(&self) -> bool {
        self.current().valid
    }

    /// Most recent `n` samples (default `HISTORY_SIZE`), oldest first.
    pub fn history(&self, n: Option<usize>) -> Vec<GpsPosition> {
        let history = self.history.lock().unwrap();
        let take = n.unwrap_or(HISTORY_SIZE).min(history.len());
        history.iter().rev().take(take).rev().copied().collect()
    }

    /// `(speed_m_s, heading_deg)`, zero when there's no current fix.
    pub fn velocity(&self) -> (f64, f64) {
        let pos = self.current();
        if pos.valid {
            (pos.speed, pos.heading)
        } else {
            (0.0, 0.0)
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GpsPosition> {
        self.tx.subscribe()
    }

    pub async fn wait_for_fix(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.has_fix() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    /// `fast` when instantaneous speed is at/above `fast_th`, `slow` at/below
    /// `slow_th`, `adaptive` in between.
    pub fn suggest_hop_mode(&self, fast_th: f64, slow_th: f64) -> &'static str {
        let (speed, _) = self.velocity();
        if speed >= fast_th {
            "fast"
        } else if speed <= slow_th {
            "slow"
        } else {
            "adaptive"
        }
    }

    fn poll_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.connect_and_read() {
                warn!("gps connection error: {e}, retrying in {RECONNECT_BACKOFF:?}");
                std::thread::sleep(RECONNECT_BACKOFF);
            }
        }
        info!("gps service stopped");
    }

    fn connect_and_read(&self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(ENABLE_WATCH_CMD.as_bytes())?;
        stream.flush()?;
        info!("connected to gpsd at {addr}");

        let mut reader = BufReader::new(stream);
        let mut sky = SkySnapshot::default();

        while self.running.load(Ordering::SeqCst) {
            match get_data(&mut reader as &mut dyn BufRead) {
                Ok(ResponseData::Sky(s)) => {
                    sky.hdop = s.hdop.unwrap_or(99.0);
                    sky.satellites_used = count_used(&s.satellites);
                }
                Ok(ResponseData::Tpv(tpv)) => {
                    let fix_quality = match tpv.mode {
                        Mode::Fix3d => 3,
                        Mode::Fix2d => 2,
                        Mode::NoFix => 0,
                    };
                    let valid = fix_quality >= 2
                        && sky.hdop <= self.min_hdop
                        && sky.satellites_used >= self.min_satellites;

                    let sample = GpsPosition {
                        lat: tpv.lat.unwrap_or(0.0),
                        lon: tpv.lon.unwrap_or(0.0),
                        alt: tpv.alt.unwrap_or(0.0) as f64,
                        speed: tpv.speed.unwrap_or(0.0) as f64,
                        heading: tpv.track.unwrap_or(0.0) as f64,
                        hdop: sky.hdop,
                        fix_quality,
                        satellites: sky.satellites_used,
                        valid,
                        timestamp: Utc::now().timestamp(),
                    };

                    debug!("gps sample: valid={} lat={} lon={}", sample.valid, sample.lat, sample.lon);

                    *self.current.lock().unwrap() = sample;
                    if valid {
                        let mut history = self.history.lock().unwrap();
                        if history.len() >= HISTORY_SIZE {
                            history.pop_front();
                        }
                        history.push_back(sample);
                    }

                    let _ = self.tx.send(sample);
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow::anyhow!("gpsd read error: {e}")),
            }
        }

        Ok(())
    }
}

fn count_used(satellites: &Option<Vec<Satellite>>) -> u32 {
    satellites
        .as_ref()
        .map(|sats| sats.iter().filter(|s| s.used).count() as u32)
        .unwrap_or(0)
}

/// Produces a small random walk around a base position, for tests and
/// `--mock-gps` runs without a live gpsd.
pub struct MockGpsSource {
    base_lat: f64,
    base_lon: f64,
    step: f64,
}

impl MockGpsSource {
    pub fn new(base_lat: f64, base_lon: f64) -> Self {
        MockGpsSource {
            base_lat,
            base_lon,
            step: 0.00005,
        }
    }

    pub fn next_position(&self, tick: u64) -> GpsPosition {
        let jitter = ((tick as f64) * 0.37).sin() * self.step;
        GpsPosition {
            lat: self.base_lat + jitter,
            lon: self.base_lon + jitter * 0.5,
            alt: 50.0,
            speed: 1.5,
            heading: (tick as f64 * 10.0) % 360.0,
            hdop: 1.2,
            fix_quality: 3,
            satellites: 8,
            valid: true,
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GpsConfig {
        GpsConfig {
            enabled: true,
            host: "localhost".to_string(),
            port: 2947,
            poll_interval: 2.0,
            min_hdop: 5.0,
            min_satellites: 4,
            wait_for_fix: false,
            fix_timeout: 30.0,
        }
    }

    #[test]
    fn invalid_position_tuple_is_zeroed() {
        let pos = GpsPosition::invalid();
        assert_eq!(pos.to_tuple(), (0.0, 0.0, 0.0, 0));
    }

    #[test]
    fn current_tuple_defaults_invalid_on_fresh_service() {
        let svc = GpsService::new(&test_config());
        assert_eq!(svc.current_tuple(), (0.0, 0.0, 0.0, 0));
        assert!(!svc.has_fix());
    }

    #[test]
    fn hop_mode_suggestion_thresholds() {
        let svc = GpsService::new(&test_config());
        *svc.current.lock().unwrap() = GpsPosition {
            valid: true,
            speed: 12.0,
            ..GpsPosition::invalid()
        };
        assert_eq!(svc.suggest_hop_mode(10.0, 2.0), "fast");

        *svc.current.lock().unwrap() = GpsPosition {
            valid: true,
            speed: 1.0,
            ..GpsPosition::invalid()
        };
        assert_eq!(svc.suggest_hop_mode(10.0, 2.0), "slow");

        *svc.current.lock().unwrap() = GpsPosition {
            valid: true,
            speed: 5.0,
            ..GpsPosition::invalid()
        };
        assert_eq!(svc.suggest_hop_mode(10.0, 2.0), "adaptive");
    }

    #[test]
    fn current_reflects_latest_sample_even_when_invalid() {
        let svc = GpsService::new(&test_config());
        *svc.current.lock().unwrap() = GpsPosition {
            valid: true,
            lat: 33.0,
            lon: -112.0,
            ..GpsPosition::invalid()
        };
        assert!(svc.has_fix());

        let lost_fix = GpsPosition {
            valid: false,
            ..GpsPosition::invalid()
        };
        *svc.current.lock().unwrap() = lost_fix;

        assert!(!svc.has_fix());
        assert_eq!(svc.current_tuple(), (0.0, 0.0, 0.0, 0));
    }

    #[test]
    fn mock_source_produces_valid_fixes() {
        let mock = MockGpsSource::new(33.4484, -112.0740);
        let pos = mock.next_position(1);
        assert!(pos.valid);
        assert!(pos.fix_quality >= 2);
    }
}
