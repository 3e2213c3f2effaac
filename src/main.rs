use airdump::config::Config;
use airdump::error::exit_code;
use airdump::orchestrator::{install_signal_handlers, Orchestrator};
use airdump::store::{DbKey, Store};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "airdump")]
#[command(author = "spikehead")]
#[command(version = "0.1.0")]
#[command(about = "Airborne wireless reconnaissance: Wi-Fi/Bluetooth capture, GPS tagging, device fingerprinting")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan: GPS + upstream poller + channel hopping + capture
    Scan {
        /// Max duration in seconds (unlimited if omitted)
        #[arg(long)]
        duration: Option<u64>,

        /// Session name/prefix
        #[arg(long)]
        session_name: Option<String>,
    },

    /// Replay any buffered writes from a prior store-write failure
    DrainBuffer,

    /// Inspect the database
    Db {
        #[command(subcommand)]
        action: DbAction,
    },

    /// Validate startup preconditions without running a scan
    Check,

    /// Write a default configuration file
    Init,
}

#[derive(Subcommand)]
enum DbAction {
    /// Show summary statistics for the latest (or a named) session
    Stats {
        #[arg(long)]
        session_id: Option<String>,
    },
    /// List devices within a radius of a point
    Nearby {
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lon: f64,
        #[arg(long, default_value = "100")]
        radius_m: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).init();

    let result = run(cli);
    match &result {
        Ok(code) => std::process::exit(*code),
        Err(e) => {
            error!("fatal: {e:?}");
            std::process::exit(exit_code::CONFIG_OR_STORE_INIT_FAILURE);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init => cmd_init(&cli.config),
        Commands::Check => cmd_check(&cli.config),
        Commands::DrainBuffer => cmd_drain_buffer(&cli.config),
        Commands::Db { action } => cmd_db(&cli.config, action),
        Commands::Scan { duration, session_name } => cmd_scan(&cli.config, duration, session_name),
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    Config::load(path).with_context(|| format!("failed to load config from {path:?}"))
}

fn cmd_init(path: &PathBuf) -> Result<i32> {
    let config = Config::default_config();
    config.save(path)?;
    info!("wrote default configuration to {path:?}");
    Ok(exit_code::CLEAN_STOP)
}

/// Validates the preconditions a scan would need: config parses, the
/// database path is writable, and (best-effort, non-fatal) the
/// capture interface and tshark binary are present.
fn cmd_check(path: &PathBuf) -> Result<i32> {
    let config = load_config(path)?;
    println!("config: OK ({path:?})");

    match Store::open(
        PathBuf::from(&config.database.path),
        PathBuf::from(&config.general.backup_dir),
        DbKey::load_if_enabled(config.database.encryption_enabled),
    ) {
        Ok(store) => {
            println!("database: OK ({})", config.database.path);
            if config.database.encryption_enabled {
                println!("encryption: {}", if store.is_encrypted() { "key loaded" } else { "enabled but no key loaded" });
            }
        }
        Err(e) => {
            println!("database: FAILED ({e})");
            return Ok(exit_code::CONFIG_OR_STORE_INIT_FAILURE);
        }
    }

    if config.capture.enabled {
        if airdump::capture::tshark_available() {
            println!("tshark: OK");
        } else {
            println!("tshark: NOT FOUND (capture will fail to start)");
        }
        if airdump::capture::interface_exists(&config.capture.interface) {
            println!("capture interface {}: present", config.capture.interface);
        } else {
            println!("capture interface {}: NOT PRESENT", config.capture.interface);
        }
    }

    if config.gps.enabled {
        match std::net::TcpStream::connect((config.gps.host.as_str(), config.gps.port)) {
            Ok(_) => println!("gpsd at {}:{}: reachable", config.gps.host, config.gps.port),
            Err(e) => println!("gpsd at {}:{}: unreachable ({e})", config.gps.host, config.gps.port),
        }
    }

    Ok(exit_code::CLEAN_STOP)
}

fn cmd_drain_buffer(path: &PathBuf) -> Result<i32> {
    let config = load_config(path)?;
    let store = Store::open(
        PathBuf::from(&config.database.path),
        PathBuf::from(&config.general.backup_dir),
        DbKey::load_if_enabled(config.database.encryption_enabled),
    )?;
    let drained = store.drain_buffer()?;
    println!("drained {drained} buffered record(s)");
    Ok(exit_code::CLEAN_STOP)
}

fn cmd_db(path: &PathBuf, action: DbAction) -> Result<i32> {
    let config = load_config(path)?;
    let store = Store::open(
        PathBuf::from(&config.database.path),
        PathBuf::from(&config.general.backup_dir),
        DbKey::load_if_enabled(config.database.encryption_enabled),
    )?;

    match action {
        DbAction::Stats { session_id } => {
            let session_id = match session_id {
                Some(id) => id,
                None => {
                    let latest = store
                        .get_latest_session()?
                        .context("no sessions in database")?;
                    latest.session_id
                }
            };
            let stats = store.get_session_stats(&session_id)?;
            println!("session {session_id}:");
            println!("  wifi_devices:   {}", stats.wifi_devices);
            println!("  wifi_unknown:   {}", stats.wifi_unknown);
            println!("  bt_devices:     {}", stats.bt_devices);
            println!("  bt_unknown:     {}", stats.bt_unknown);
            println!("  gps_points:     {}", stats.gps_points);
        }
        DbAction::Nearby { lat, lon, radius_m } => {
            let results = store.devices_within(lat, lon, radius_m, None)?;
            for (key, device_lat, device_lon, _) in &results {
                let distance = store.distance_to(lat, lon, *device_lat, *device_lon);
                println!("{key}: {distance:.1}m");
            }
            println!("{} device(s) within {radius_m}m", results.len());
        }
    }

    Ok(exit_code::CLEAN_STOP)
}

fn cmd_scan(path: &PathBuf, duration: Option<u64>, session_name: Option<String>) -> Result<i32> {
    let config = load_config(path)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let exit = runtime.block_on(async move {
        let orchestrator = match Orchestrator::new(config) {
            Ok(o) => o,
            Err(e) => {
                error!("failed to initialize orchestrator: {e}");
                return exit_code::CONFIG_OR_STORE_INIT_FAILURE;
            }
        };

        install_signal_handlers(orchestrator.clone());

        if let Err(e) = orchestrator.start(session_name.as_deref()).await {
            error!("failed to start scan: {e:?}");
            orchestrator.stop().await;
            return exit_code::CONFIG_OR_STORE_INIT_FAILURE;
        }

        orchestrator.run_for(duration.map(Duration::from_secs)).await;
        orchestrator.exit_code()
    });

    Ok(exit)
}
