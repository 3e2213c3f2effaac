//! Orchestrator: owns the lifecycle of every other component, wires
//! their callbacks together, drives the ~10s main loop, and guarantees
//! the wireless interface is restored to managed mode on every exit
//! path — including a panic — without resorting to a mutable global and
//! `atexit` the way the original implementation did (§9 redesign flag).

use crate::capture::{self, CaptureConfig, CaptureSession};
use crate::channels::ChannelHopPolicy;
use crate::config::Config;
use crate::error::{exit_code, AirdumpError};
use crate::fingerprint::FingerprintEngine;
use crate::gps::GpsService;
use crate::iface;
use crate::poller::{UpstreamDevice, UpstreamPoller};
use crate::power::PowerMonitor;
use crate::store::models::GpsTrackPoint;
use crate::store::{DbKey, Store};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAIN_LOOP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorStats {
    pub wifi_devices: u64,
    pub bt_devices: u64,
    pub gps_fixes: u64,
}

/// Guards interface restoration: whichever of "signal handler", "Drop",
/// or an explicit `stop()` call runs first performs the restore; the
/// others observe `stopped` already set and no-op. No process-wide
/// static holds the orchestrator itself — the guard only needs to know
/// which interface to hand back, which it reads from `Orchestrator`
/// through the `Arc` it's handed at construction.
struct ExitGuard {
    interface: Mutex<Option<String>>,
    stopped: AtomicBool,
    restore_failed: AtomicBool,
}

impl ExitGuard {
    fn restore_once(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let interface = self.interface.lock().unwrap().clone();
        if let Err(e) = iface::restore_managed_mode(interface.as_deref()) {
            error!("interface restore failed on exit: {e}");
            self.restore_failed.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.restore_once();
    }
}

pub struct Orchestrator {
    config: Config,
    store: Arc<Store>,
    gps: Option<Arc<GpsService>>,
    poller: Option<Arc<UpstreamPoller>>,
    channel_hop: Arc<ChannelHopPolicy>,
    fingerprint: Arc<FingerprintEngine>,
    power: Option<Arc<PowerMonitor>>,
    capture: Mutex<Option<CaptureSession>>,
    exit_guard: ExitGuard,
    session_id: Mutex<Option<String>>,
    stats: Mutex<OrchestratorStats>,
    running: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Builds the Store and every component whose construction can't
    /// fail; failures that aren't the Store itself are logged and the
    /// component is simply left absent (§7: GPS/poller/capture/power
    /// are non-critical).
    pub fn new(config: Config) -> Result<Arc<Self>, AirdumpError> {
        let store = Store::open(
            std::path::PathBuf::from(&config.database.path),
            std::path::PathBuf::from(&config.general.backup_dir),
            DbKey::load_if_enabled(config.database.encryption_enabled),
        )?;
        let store = Arc::new(store);

        let gps = if config.gps.enabled {
            let svc = Arc::new(GpsService::new(&config.gps));
            match svc.connect() {
                Ok(()) => Some(svc),
                Err(e) => {
                    warn!("GPS initialization failed, continuing without GPS: {e}");
                    None
                }
            }
        } else {
            info!("GPS disabled in config");
            None
        };

        let poller = match UpstreamPoller::new(&config.kismet) {
            Ok(p) => {
                let p = Arc::new(p);
                match p.check_connection() {
                    Ok(()) => Some(p),
                    Err(e) => {
                        warn!("upstream capture daemon unreachable, continuing without it: {e}");
                        None
                    }
                }
            }
            Err(e) => {
                warn!("upstream poller initialization failed: {e}");
                None
            }
        };

        let channel_hop = Arc::new(ChannelHopPolicy::new(
            &config.channel_hopping.default_mode,
            config.channel_hopping.fast_rate,
            config.channel_hopping.slow_rate,
        ));

        let fingerprint = Arc::new(FingerprintEngine::new(gps.clone(), Some(store.clone()), true));

        let power = if config.power.monitor_enabled {
            Some(Arc::new(PowerMonitor::new(&config.power)))
        } else {
            info!("power monitoring disabled in config");
            None
        };

        Ok(Arc::new(Orchestrator {
            config,
            store,
            gps,
            poller,
            channel_hop,
            fingerprint,
            power,
            capture: Mutex::new(None),
            exit_guard: ExitGuard {
                interface: Mutex::new(None),
                stopped: AtomicBool::new(false),
                restore_failed: AtomicBool::new(false),
            },
            session_id: Mutex::new(None),
            stats: Mutex::new(OrchestratorStats::default()),
            running: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn stats(&self) -> OrchestratorStats {
        *self.stats.lock().unwrap()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    /// Startup order: Store (already open), GPS, Upstream Poller,
    /// Channel-Hop Policy, Fingerprint Engine (already built), Power
    /// Monitor, external capture tool. Only a Store failure is fatal;
    /// everything else degrades gracefully and is logged.
    pub async fn start(self: &Arc<Self>, session_name: Option<&str>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let session = self
            .store
            .create_session(&self.config.general.node_id, None, session_name)
            .context("failed to create scan session")?;
        *self.session_id.lock().unwrap() = Some(session.session_id.clone());
        self.fingerprint.set_session(session.session_id.clone());
        info!("created session: {}", session.session_id);

        if let Some(gps) = &self.gps {
            gps.start();
            if self.config.gps.wait_for_fix {
                let timeout = Duration::from_secs_f64(self.config.gps.fix_timeout);
                info!("waiting for GPS fix (timeout: {timeout:?})...");
                if gps.wait_for_fix(timeout).await {
                    info!("GPS fix acquired");
                } else {
                    warn!("GPS fix timeout, continuing without fix");
                }
            }
            self.spawn_gps_track_task(Arc::clone(gps));
        }

        if let Some(poller) = &self.poller {
            poller.start();
            if let Ok(sources) = poller.datasources() {
                if let Some(source_id) = sources.into_iter().next() {
                    self.channel_hop.set_active_source(&source_id);
                }
            }
            self.spawn_poller_task(Arc::clone(poller));
        }

        if self.config.capture.enabled {
            let pcap_dir = std::path::PathBuf::from(&self.config.general.data_dir).join("pcap");
            let _ = std::fs::create_dir_all(&pcap_dir);
            let capture_config = CaptureConfig {
                interface: self.config.capture.interface.clone(),
                output_dir: pcap_dir,
                max_file_size_mb: self.config.capture.max_file_size_mb,
                files_to_keep: self.config.capture.files_to_keep,
                filter: self.config.capture.filter.clone(),
            };
            *self.exit_guard.interface.lock().unwrap() = Some(capture_config.interface.clone());
            match capture::start_capture(&session.session_id, &capture_config) {
                Ok(session) => *self.capture.lock().unwrap() = Some(session),
                Err(e) => warn!("capture tool initialization failed, continuing without it: {e}"),
            }
        }

        if let Some(power) = &self.power {
            self.spawn_power_task(Arc::clone(power));
        }

        self.spawn_main_loop();
        info!("orchestrator started");
        Ok(())
    }

    fn spawn_gps_track_task(self: &Arc<Self>, gps: Arc<GpsService>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = gps.subscribe();
            while this.running.load(Ordering::SeqCst) {
                match rx.recv().await {
                    Ok(pos) if pos.valid => {
                        this.stats.lock().unwrap().gps_fixes += 1;
                        if let Some(session_id) = this.session_id() {
                            let point = GpsTrackPoint {
                                session_id,
                                timestamp: pos.timestamp,
                                lat: pos.lat,
                                lon: pos.lon,
                                alt: Some(pos.alt),
                                speed: Some(pos.speed),
                                track: Some(pos.heading),
                                hdop: Some(pos.hdop),
                                satellites: pos.satellites as i32,
                                fix_quality: pos.fix_quality as i32,
                            };
                            if let Err(e) = this.store.insert_gps_point(&point) {
                                debug!("failed to log gps point: {e}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn spawn_poller_task(self: &Arc<Self>, poller: Arc<UpstreamPoller>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_secs_f64(this.config.kismet.poll_interval);
            while this.running.load(Ordering::SeqCst) && poller.is_running() {
                match poller.poll() {
                    Ok(devices) => {
                        for device in &devices {
                            this.on_new_device(device);
                        }
                    }
                    Err(e) => debug!("upstream poll failed: {e}"),
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    fn on_new_device(&self, device: &UpstreamDevice) {
        match device {
            UpstreamDevice::Wifi(_) => self.stats.lock().unwrap().wifi_devices += 1,
            UpstreamDevice::Bt(_) => self.stats.lock().unwrap().bt_devices += 1,
            UpstreamDevice::Unknown => {}
        }
        if let Some(hash) = self.fingerprint.on_external_device(device) {
            debug!("fingerprinted device {}...", &hash[..16.min(hash.len())]);
        }
    }

    fn spawn_power_task(self: &Arc<Self>, power: Arc<PowerMonitor>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                let state = power.sample();
                match state {
                    crate::power::PowerState::Warning => warn!("power warning: {:.2}V", power.stats().voltage),
                    crate::power::PowerState::Critical => {
                        warn!("power critical, saving state: {:.2}V", power.stats().voltage);
                        let _ = this.store.flush();
                    }
                    crate::power::PowerState::Shutdown => {
                        error!("power shutdown threshold reached, stopping");
                        this.stop().await;
                        break;
                    }
                    crate::power::PowerState::Ok => {}
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    fn spawn_main_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                let speed = this.gps.as_ref().map(|g| g.velocity().0).unwrap_or(0.0);
                if let Some(poller) = &this.poller {
                    if let Err(e) = this.channel_hop.tick(speed, poller.as_ref()) {
                        debug!("channel hop tick failed: {e}");
                    }
                }

                let stats = this.stats();
                let counts = this.poller.as_ref().map(|p| p.count()).unwrap_or_default();
                info!(
                    "stats: wifi={} bt={} gps_fixes={} upstream_total={}",
                    stats.wifi_devices, stats.bt_devices, stats.gps_fixes, counts.total
                );

                tokio::time::sleep(MAIN_LOOP_INTERVAL).await;
            }
        });
    }

    /// Blocks until `duration` elapses or `stop()` is called from
    /// elsewhere (e.g. a signal handler or the power-monitor task),
    /// then performs shutdown if it hasn't happened already.
    pub async fn run_for(self: &Arc<Self>, duration: Option<Duration>) {
        match duration {
            Some(d) => {
                tokio::select! {
                    _ = tokio::time::sleep(d) => {}
                    _ = self.wait_until_stopped() => {}
                }
            }
            None => self.wait_until_stopped().await,
        }
        self.stop().await;
    }

    async fn wait_until_stopped(&self) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Idempotent shutdown, reverse startup order plus interface
    /// restore. Safe to call from a signal handler, the power-monitor
    /// task, or the CLI's own unwind path; only the first caller does
    /// any work.
    pub async fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping orchestrator...");
        // The power-monitor task exits on its own once `running` flips.

        if let Some(session) = self.capture.lock().unwrap().take() {
            session.stop().await;
        }

        if let Some(poller) = &self.poller {
            poller.stop();
        }

        if let Some(gps) = &self.gps {
            gps.stop();
        }

        if let Some(session_id) = self.session_id() {
            if let Err(e) = self.store.end_session(&session_id) {
                warn!("failed to finalize session: {e}");
            }
        }

        if let Err(e) = self.store.drain_buffer() {
            warn!("failed to drain store buffer on shutdown: {e}");
        }
        let _ = self.store.flush();

        self.exit_guard.restore_once();

        info!("orchestrator stopped");
    }

    /// Exit code for a completed scan: 0 unless the interface failed to
    /// restore on shutdown, per §6.6's exit-code contract.
    pub fn exit_code(&self) -> i32 {
        if self.exit_guard.restore_failed.load(Ordering::SeqCst) {
            exit_code::INTERFACE_RESTORE_FAILED
        } else {
            exit_code::CLEAN_STOP
        }
    }
}

/// Installs SIGTERM/SIGINT handlers that call `orchestrator.stop()`.
/// Uses `ctrlc` for SIGINT portability and `tokio::signal` for SIGTERM,
/// mirroring the teacher's preference for the `ctrlc` crate while still
/// covering the Unix-only signal the original's `signal.signal` handled
/// for both.
pub fn install_signal_handlers(orchestrator: Arc<Orchestrator>) {
    let handle = tokio::runtime::Handle::current();
    let o = Arc::clone(&orchestrator);
    let _ = ctrlc::set_handler(move || {
        info!("received SIGINT, initiating graceful shutdown");
        let o = Arc::clone(&o);
        handle.spawn(async move { o.stop().await });
    });

    #[cfg(unix)]
    {
        let o = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if let Ok(mut term) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                term.recv().await;
                info!("received SIGTERM, initiating graceful shutdown");
                o.stop().await;
            }
        });
    }
}
