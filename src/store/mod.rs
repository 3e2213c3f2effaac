//! Durable store: sessions, device upserts, GPS track, fingerprint
//! signatures, pcap metadata, and a file-backed buffer for writes that
//! fail after exhausting their retries.

pub mod models;

use crate::error::AirdumpError;
use crate::util::{generate_session_id, haversine_distance, normalize_mac};
use anyhow::{Context, Result};
use log::{info, warn};
use models::{
    BtDevice, BufferedKind, FingerprintSignature, GpsTrackPoint, PcapFile, ScanSession,
    SessionStatus, WifiDevice,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_INSERT_RETRIES: u32 = 3;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS scan_sessions (
    session_id TEXT PRIMARY KEY,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    status TEXT NOT NULL DEFAULT 'starting',
    property_id TEXT,
    node_id TEXT NOT NULL,
    wifi_count INTEGER NOT NULL DEFAULT 0,
    bt_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS wifi_devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    device_key TEXT NOT NULL,
    bssid TEXT NOT NULL,
    essid TEXT,
    device_type TEXT NOT NULL DEFAULT 'unknown',
    channel INTEGER,
    frequency INTEGER,
    signal_dbm INTEGER,
    encryption TEXT,
    manufacturer TEXT,
    packets_total INTEGER NOT NULL DEFAULT 0,
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    gps_lat REAL,
    gps_lon REAL,
    gps_alt REAL,
    gps_valid INTEGER NOT NULL DEFAULT 0,
    fingerprint_hash TEXT,
    fingerprint_data TEXT,
    is_known INTEGER NOT NULL DEFAULT 0,
    identified_as TEXT,
    is_duplicate INTEGER NOT NULL DEFAULT 0,
    duplicate_of_id INTEGER,
    seen_by_nodes TEXT NOT NULL DEFAULT '[]',
    UNIQUE(session_id, device_key)
);

CREATE TABLE IF NOT EXISTS bt_devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    device_key TEXT NOT NULL,
    mac TEXT NOT NULL,
    name TEXT,
    device_type TEXT NOT NULL DEFAULT 'unknown',
    device_class TEXT,
    rssi INTEGER,
    manufacturer TEXT,
    service_uuids TEXT NOT NULL DEFAULT '[]',
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    gps_lat REAL,
    gps_lon REAL,
    gps_alt REAL,
    gps_valid INTEGER NOT NULL DEFAULT 0,
    fingerprint_hash TEXT,
    is_known INTEGER NOT NULL DEFAULT 0,
    identified_as TEXT,
    is_duplicate INTEGER NOT NULL DEFAULT 0,
    duplicate_of_id INTEGER,
    seen_by_nodes TEXT NOT NULL DEFAULT '[]',
    UNIQUE(session_id, device_key)
);

CREATE TABLE IF NOT EXISTS gps_track (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    alt REAL,
    speed REAL,
    track REAL,
    hdop REAL,
    satellites INTEGER NOT NULL DEFAULT 0,
    fix_quality INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS fingerprint_signatures (
    fingerprint_hash TEXT PRIMARY KEY,
    device_type TEXT NOT NULL,
    model TEXT,
    os_version TEXT,
    confidence REAL NOT NULL DEFAULT 0.0,
    identifiers TEXT,
    first_seen INTEGER NOT NULL,
    times_seen INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS pcap_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    packet_count INTEGER,
    encrypted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_wifi_session ON wifi_devices(session_id);
CREATE INDEX IF NOT EXISTS idx_wifi_bssid ON wifi_devices(bssid);
CREATE INDEX IF NOT EXISTS idx_wifi_fingerprint ON wifi_devices(fingerprint_hash);
CREATE INDEX IF NOT EXISTS idx_bt_session ON bt_devices(session_id);
CREATE INDEX IF NOT EXISTS idx_bt_mac ON bt_devices(mac);
CREATE INDEX IF NOT EXISTS idx_bt_fingerprint ON bt_devices(fingerprint_hash);
CREATE INDEX IF NOT EXISTS idx_gps_session ON gps_track(session_id);
CREATE INDEX IF NOT EXISTS idx_gps_timestamp ON gps_track(timestamp);
CREATE INDEX IF NOT EXISTS idx_pcap_session ON pcap_files(session_id);
"#;

/// Default tmpfs-backed path for the at-rest encryption key.
pub const DEFAULT_KEY_PATH: &str = "/run/airdump/db.key";

/// Zero-on-drop holder for an at-rest encryption key. The connection is
/// still opened unencrypted (see DESIGN.md); this only tracks whether a
/// key was loaded, for `Store::is_encrypted()`.
pub struct DbKey(Vec<u8>);

impl DbKey {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read encryption key: {path:?}"))?;
        Ok(DbKey(bytes))
    }

    /// Loads the key from `DEFAULT_KEY_PATH` when `enabled` is set. A
    /// missing or unreadable key file is logged and treated as "no key"
    /// rather than a fatal error, matching the original's graceful
    /// fallback when its cipher backend was unavailable.
    pub fn load_if_enabled(enabled: bool) -> Option<Self> {
        if !enabled {
            return None;
        }
        match DbKey::load(Path::new(DEFAULT_KEY_PATH)) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("encryption_enabled is set but key could not be loaded from {DEFAULT_KEY_PATH}: {e}");
                None
            }
        }
    }
}

impl Drop for DbKey {
    fn drop(&mut self) {
        for b in self.0.iter_mut() {
            *b = 0;
        }
    }
}

pub struct Store {
    conn: Connection,
    backup_dir: PathBuf,
    key: Option<DbKey>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(
        path: P,
        backup_dir: P,
        key: Option<DbKey>,
    ) -> Result<Self, AirdumpError> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::create_dir_all(backup_dir.as_ref());

        let conn = Connection::open(path.as_ref())
            .map_err(|e| AirdumpError::StoreWriteFatal(e.to_string()))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| AirdumpError::StoreWriteFatal(e.to_string()))?;

        // WAL is unavailable (and unnecessary) on a read-only file; don't
        // treat that as fatal.
        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!("could not enable WAL journal mode (likely read-only db): {e}");
        }

        let store = Store {
            conn,
            backup_dir: backup_dir.as_ref().to_path_buf(),
            key,
        };
        store
            .initialize_schema()
            .map_err(|e| AirdumpError::StoreWriteFatal(e.to_string()))?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Store {
            conn,
            backup_dir: std::env::temp_dir(),
            key: None,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // ---- sessions ----------------------------------------------------

    pub fn create_session(
        &self,
        node_id: &str,
        property_id: Option<&str>,
        prefix: Option<&str>,
    ) -> Result<ScanSession> {
        let session_id = generate_session_id(prefix);
        let start_time = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO scan_sessions (session_id, start_time, status, property_id, node_id)
             VALUES (?1, ?2, 'starting', ?3, ?4)",
            params![session_id, start_time, property_id, node_id],
        )?;
        Ok(ScanSession {
            session_id,
            start_time,
            end_time: None,
            status: SessionStatus::Starting,
            property_id: property_id.map(str::to_string),
            node_id: node_id.to_string(),
            wifi_count: 0,
            bt_count: 0,
        })
    }

    pub fn update_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE scan_sessions SET status = ?1 WHERE session_id = ?2",
            params![status.as_str(), session_id],
        )?;
        Ok(())
    }

    pub fn end_session(&self, session_id: &str) -> Result<()> {
        let (wifi_count, bt_count) = self.get_session_device_counts(session_id)?;
        self.conn.execute(
            "UPDATE scan_sessions
             SET end_time = ?1, status = 'stopped', wifi_count = ?2, bt_count = ?3
             WHERE session_id = ?4",
            params![chrono::Utc::now().timestamp(), wifi_count, bt_count, session_id],
        )?;
        Ok(())
    }

    fn get_session_device_counts(&self, session_id: &str) -> Result<(i64, i64)> {
        let wifi_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM wifi_devices WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let bt_count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bt_devices WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok((wifi_count, bt_count))
    }

    pub fn get_latest_session(&self) -> Result<Option<ScanSession>> {
        self.conn
            .query_row(
                "SELECT session_id, start_time, end_time, status, property_id, node_id,
                        wifi_count, bt_count
                 FROM scan_sessions ORDER BY start_time DESC LIMIT 1",
                [],
                |row| {
                    Ok(ScanSession {
                        session_id: row.get(0)?,
                        start_time: row.get(1)?,
                        end_time: row.get(2)?,
                        status: SessionStatus::parse(&row.get::<_, String>(3)?),
                        property_id: row.get(4)?,
                        node_id: row.get(5)?,
                        wifi_count: row.get(6)?,
                        bt_count: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    // ---- device upserts ------------------------------------------------

    /// Insert or merge a Wi-Fi device, retrying transient failures and
    /// falling back to the file buffer after `MAX_INSERT_RETRIES`.
    pub fn insert_wifi_device(&self, session_id: &str, device: &WifiDevice) -> Result<()> {
        for attempt in 0..MAX_INSERT_RETRIES {
            match self.do_insert_wifi(session_id, device) {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < MAX_INSERT_RETRIES => {
                    warn!("wifi device insert failed (attempt {}): {e}", attempt + 1);
                    std::thread::sleep(Duration::from_secs_f64(0.1 * (attempt + 1) as f64));
                }
                Err(e) => {
                    warn!("wifi device insert exhausted retries, buffering: {e}");
                    self.buffer_record(BufferedKind::Wifi, session_id, device)?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn do_insert_wifi(&self, session_id: &str, device: &WifiDevice) -> Result<()> {
        let bssid = normalize_mac(&device.bssid);
        self.transaction(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM wifi_devices WHERE session_id = ?1 AND device_key = ?2",
                    params![session_id, device.device_key],
                    |row| row.get(0),
                )
                .optional()?;

            let seen_by_nodes = serde_json::to_string(&device.seen_by_nodes)?;

            match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE wifi_devices SET
                            essid = COALESCE(?1, essid),
                            device_type = COALESCE(?2, device_type),
                            encryption = COALESCE(?3, encryption),
                            fingerprint_hash = COALESCE(?4, fingerprint_hash),
                            fingerprint_data = COALESCE(?5, fingerprint_data),
                            manufacturer = COALESCE(?6, manufacturer),
                            channel = ?7,
                            frequency = ?8,
                            signal_dbm = ?9,
                            packets_total = ?10,
                            last_seen = ?11,
                            gps_lat = ?12,
                            gps_lon = ?13,
                            gps_alt = ?14,
                            gps_valid = ?15,
                            is_known = ?16,
                            identified_as = COALESCE(?17, identified_as)
                         WHERE id = ?18",
                        params![
                            device.essid,
                            non_empty(&device.device_type),
                            device.encryption,
                            device.fingerprint_hash,
                            device.fingerprint_data,
                            device.manuf,
                            device.channel,
                            device.frequency,
                            device.signal_dbm,
                            device.packets_total,
                            device.last_seen,
                            device.lat,
                            device.lon,
                            device.alt,
                            device.gps_valid as i32,
                            device.is_known as i32,
                            device.identified_as,
                            id,
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO wifi_devices (
                            session_id, device_key, bssid, essid, device_type, channel,
                            frequency, signal_dbm, encryption, manufacturer, packets_total,
                            first_seen, last_seen, gps_lat, gps_lon, gps_alt, gps_valid,
                            fingerprint_hash, fingerprint_data, is_known, identified_as,
                            seen_by_nodes
                         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
                        params![
                            session_id,
                            device.device_key,
                            bssid,
                            device.essid,
                            device.device_type,
                            device.channel,
                            device.frequency,
                            device.signal_dbm,
                            device.encryption,
                            device.manuf,
                            device.packets_total,
                            device.first_seen,
                            device.last_seen,
                            device.lat,
                            device.lon,
                            device.alt,
                            device.gps_valid as i32,
                            device.fingerprint_hash,
                            device.fingerprint_data,
                            device.is_known as i32,
                            device.identified_as,
                            seen_by_nodes,
                        ],
                    )?;
                }
            }
            Ok(())
        })
    }

    pub fn insert_bt_device(&self, session_id: &str, device: &BtDevice) -> Result<()> {
        for attempt in 0..MAX_INSERT_RETRIES {
            match self.do_insert_bt(session_id, device) {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < MAX_INSERT_RETRIES => {
                    warn!("bt device insert failed (attempt {}): {e}", attempt + 1);
                    std::thread::sleep(Duration::from_secs_f64(0.1 * (attempt + 1) as f64));
                }
                Err(e) => {
                    warn!("bt device insert exhausted retries, buffering: {e}");
                    self.buffer_record(BufferedKind::Bt, session_id, device)?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn do_insert_bt(&self, session_id: &str, device: &BtDevice) -> Result<()> {
        let mac = normalize_mac(&device.mac);
        self.transaction(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM bt_devices WHERE session_id = ?1 AND device_key = ?2",
                    params![session_id, device.device_key],
                    |row| row.get(0),
                )
                .optional()?;

            let service_uuids = serde_json::to_string(&device.service_uuids)?;

            match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE bt_devices SET
                            name = COALESCE(?1, name),
                            device_type = COALESCE(?2, device_type),
                            device_class = COALESCE(?3, device_class),
                            fingerprint_hash = COALESCE(?4, fingerprint_hash),
                            manufacturer = COALESCE(?5, manufacturer),
                            rssi = ?6,
                            last_seen = ?7,
                            gps_lat = ?8,
                            gps_lon = ?9,
                            gps_alt = ?10,
                            gps_valid = ?11,
                            is_known = ?12,
                            identified_as = COALESCE(?13, identified_as)
                         WHERE id = ?14",
                        params![
                            device.name,
                            non_empty(&device.device_type),
                            device.device_class,
                            device.fingerprint_hash,
                            device.manuf,
                            device.rssi,
                            device.last_seen,
                            device.lat,
                            device.lon,
                            device.alt,
                            device.gps_valid as i32,
                            device.is_known as i32,
                            device.identified_as,
                            id,
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO bt_devices (
                            session_id, device_key, mac, name, device_type, device_class,
                            rssi, manufacturer, service_uuids, first_seen, last_seen,
                            gps_lat, gps_lon, gps_alt, gps_valid, fingerprint_hash, is_known,
                            identified_as, seen_by_nodes
                         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                        params![
                            session_id,
                            device.device_key,
                            mac,
                            device.name,
                            device.device_type,
                            device.device_class,
                            device.rssi,
                            device.manuf,
                            service_uuids,
                            device.first_seen,
                            device.last_seen,
                            device.lat,
                            device.lon,
                            device.alt,
                            device.gps_valid as i32,
                            device.fingerprint_hash,
                            device.is_known as i32,
                            device.identified_as,
                            serde_json::to_string(&device.seen_by_nodes)?,
                        ],
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Replace a device's stored coordinates from an external (e.g.
    /// flight-log) source, marking them valid.
    pub fn update_device_geo(
        &self,
        table: &str,
        device_id: i64,
        lat: f64,
        lon: f64,
        alt: Option<f64>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET gps_lat = ?1, gps_lon = ?2, gps_alt = ?3, gps_valid = 1 WHERE id = ?4"
        );
        self.conn.execute(&sql, params![lat, lon, alt, device_id])?;
        Ok(())
    }

    // ---- signatures ------------------------------------------------

    pub fn insert_signature(&self, sig: &FingerprintSignature) -> Result<()> {
        self.transaction(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT times_seen FROM fingerprint_signatures WHERE fingerprint_hash = ?1",
                    params![sig.fingerprint_hash],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(times_seen) => {
                    tx.execute(
                        "UPDATE fingerprint_signatures SET times_seen = ?1 WHERE fingerprint_hash = ?2",
                        params![times_seen + 1, sig.fingerprint_hash],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO fingerprint_signatures (
                            fingerprint_hash, device_type, model, os_version, confidence,
                            identifiers, first_seen, times_seen
                         ) VALUES (?1,?2,?3,?4,?5,?6,?7,1)",
                        params![
                            sig.fingerprint_hash,
                            sig.device_type,
                            sig.model,
                            sig.os_version,
                            sig.confidence,
                            sig.identifiers,
                            sig.first_seen,
                        ],
                    )?;
                }
            }
            Ok(())
        })
    }

    // ---- gps track ------------------------------------------------

    pub fn insert_gps_point(&self, point: &GpsTrackPoint) -> Result<()> {
        self.conn.execute(
            "INSERT INTO gps_track (
                session_id, timestamp, lat, lon, alt, speed, track, hdop, satellites, fix_quality
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                point.session_id,
                point.timestamp,
                point.lat,
                point.lon,
                point.alt,
                point.speed,
                point.track,
                point.hdop,
                point.satellites,
                point.fix_quality,
            ],
        )?;
        Ok(())
    }

    // ---- pcap metadata ------------------------------------------------

    pub fn insert_pcap(&self, file: &PcapFile) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pcap_files (
                session_id, filename, start_time, end_time, size_bytes, packet_count, encrypted
             ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                file.session_id,
                file.filename,
                file.start_time,
                file.end_time,
                file.size_bytes,
                file.packet_count,
                file.encrypted as i32,
            ],
        )?;
        Ok(())
    }

    // ---- spatial query ------------------------------------------------

    /// Devices (wifi, then bt) whose stored coordinates fall inside a
    /// bounding box of side `2 * radius_m` around `(lat, lon)`, ordered
    /// ascending by squared-degree distance (not true haversine — see
    /// §4.5.6). Callers wanting sphere-accurate ordering should
    /// post-filter with [`crate::util::haversine_distance`].
    pub fn devices_within(
        &self,
        lat: f64,
        lon: f64,
        radius_m: f64,
        session_id: Option<&str>,
    ) -> Result<Vec<(String, f64, f64, f64)>> {
        let deg_radius = radius_m / 111_000.0;
        let min_lat = lat - deg_radius;
        let max_lat = lat + deg_radius;
        let min_lon = lon - deg_radius;
        let max_lon = lon + deg_radius;

        let mut results = Vec::new();
        for (table, key_col) in [("wifi_devices", "bssid"), ("bt_devices", "mac")] {
            let sql = format!(
                "SELECT {key_col}, gps_lat, gps_lon,
                        (gps_lat - ?1) * (gps_lat - ?1) + (gps_lon - ?2) * (gps_lon - ?2) AS d2
                 FROM {table}
                 WHERE gps_valid = 1 AND gps_lat BETWEEN ?3 AND ?4 AND gps_lon BETWEEN ?5 AND ?6
                   AND (?7 IS NULL OR session_id = ?7)
                 ORDER BY d2 ASC"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![lat, lon, min_lat, max_lat, min_lon, max_lon, session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                    ))
                },
            )?;
            for row in rows {
                results.push(row?);
            }
        }
        results.sort_by(|a, b| a.3.partial_cmp(&b.3).unwrap());
        Ok(results)
    }

    /// Exact haversine distance in meters between a point and a device
    /// row's stored coordinates, for callers post-filtering `devices_within`.
    pub fn distance_to(&self, lat: f64, lon: f64, device_lat: f64, device_lon: f64) -> f64 {
        haversine_distance(lat, lon, device_lat, device_lon)
    }

    pub fn get_session_stats(&self, session_id: &str) -> Result<SessionStats> {
        let wifi_devices: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM wifi_devices WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let wifi_unknown: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM wifi_devices WHERE session_id = ?1 AND is_known = 0",
            params![session_id],
            |row| row.get(0),
        )?;
        let bt_devices: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bt_devices WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let bt_unknown: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bt_devices WHERE session_id = ?1 AND is_known = 0",
            params![session_id],
            |row| row.get(0),
        )?;
        let gps_points: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM gps_track WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        Ok(SessionStats {
            wifi_devices,
            wifi_unknown,
            bt_devices,
            bt_unknown,
            gps_points,
        })
    }

    // ---- buffer / recovery ------------------------------------------------

    fn buffer_record<T: serde::Serialize>(
        &self,
        kind: BufferedKind,
        session_id: &str,
        record: &T,
    ) -> Result<()> {
        let epoch = chrono::Utc::now().timestamp();
        let path = self
            .backup_dir
            .join(format!("buffer_{}_{}.jsonl", kind.as_str(), epoch));
        let envelope = serde_json::json!({ "session_id": session_id, "record": record });
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');
        use std::io::Write;
        let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
        f.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Replay every buffered `.jsonl` file line-by-line through the normal
    /// insert path, deleting a file only once every one of its lines has
    /// replayed successfully.
    pub fn drain_buffer(&self) -> Result<usize> {
        let mut drained = 0;
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !name.starts_with("buffer_") || !name.ends_with(".jsonl") {
                continue;
            }

            let kind = if name.starts_with("buffer_wifi_") {
                BufferedKind::Wifi
            } else if name.starts_with("buffer_bt_") {
                BufferedKind::Bt
            } else {
                continue;
            };

            let content = fs::read_to_string(&path)?;
            let mut all_ok = true;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let envelope: serde_json::Value = serde_json::from_str(line)?;
                let session_id = envelope["session_id"].as_str().unwrap_or_default();
                let record = &envelope["record"];

                let result = match kind {
                    BufferedKind::Wifi => {
                        serde_json::from_value::<WifiDevice>(record.clone())
                            .map_err(anyhow::Error::from)
                            .and_then(|d| self.do_insert_wifi(session_id, &d))
                    }
                    BufferedKind::Bt => {
                        serde_json::from_value::<BtDevice>(record.clone())
                            .map_err(anyhow::Error::from)
                            .and_then(|d| self.do_insert_bt(session_id, &d))
                    }
                };

                if result.is_ok() {
                    drained += 1;
                } else {
                    all_ok = false;
                    break;
                }
            }

            if all_ok {
                let _ = fs::remove_file(&path);
            }
        }

        Ok(drained)
    }

    /// Best-effort checkpoint; called on power-warning/critical and on
    /// orchestrator shutdown.
    pub fn flush(&self) -> Result<()> {
        let _ = self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);");
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() || s == "unknown" {
        None
    } else {
        Some(s)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub wifi_devices: i64,
    pub wifi_unknown: i64,
    pub bt_devices: i64,
    pub bt_unknown: i64,
    pub gps_points: i64,
}

impl serde::Serialize for WifiDevice {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("WifiDevice", 22)?;
        s.serialize_field("device_key", &self.device_key)?;
        s.serialize_field("bssid", &self.bssid)?;
        s.serialize_field("essid", &self.essid)?;
        s.serialize_field("device_type", &self.device_type)?;
        s.serialize_field("channel", &self.channel)?;
        s.serialize_field("frequency", &self.frequency)?;
        s.serialize_field("signal_dbm", &self.signal_dbm)?;
        s.serialize_field("encryption", &self.encryption)?;
        s.serialize_field("manuf", &self.manuf)?;
        s.serialize_field("packets_total", &self.packets_total)?;
        s.serialize_field("first_seen", &self.first_seen)?;
        s.serialize_field("last_seen", &self.last_seen)?;
        s.serialize_field("lat", &self.lat)?;
        s.serialize_field("lon", &self.lon)?;
        s.serialize_field("alt", &self.alt)?;
        s.serialize_field("gps_valid", &self.gps_valid)?;
        s.serialize_field("fingerprint_hash", &self.fingerprint_hash)?;
        s.serialize_field("fingerprint_data", &self.fingerprint_data)?;
        s.serialize_field("is_known", &self.is_known)?;
        s.serialize_field("identified_as", &self.identified_as)?;
        s.serialize_field("is_duplicate", &self.is_duplicate)?;
        s.serialize_field("duplicate_of_id", &self.duplicate_of_id)?;
        s.end()
    }
}

impl<'de> serde::Deserialize<'de> for WifiDevice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Shadow {
            device_key: String,
            bssid: String,
            essid: Option<String>,
            device_type: String,
            channel: Option<i32>,
            frequency: Option<i32>,
            signal_dbm: Option<i32>,
            encryption: Option<String>,
            manuf: Option<String>,
            packets_total: i64,
            first_seen: i64,
            last_seen: i64,
            lat: Option<f64>,
            lon: Option<f64>,
            alt: Option<f64>,
            gps_valid: bool,
            fingerprint_hash: Option<String>,
            fingerprint_data: Option<String>,
            is_known: bool,
            identified_as: Option<String>,
            #[serde(default)]
            is_duplicate: bool,
            #[serde(default)]
            duplicate_of_id: Option<i64>,
        }
        let shadow = Shadow::deserialize(deserializer)?;
        Ok(WifiDevice {
            device_key: shadow.device_key,
            bssid: shadow.bssid,
            essid: shadow.essid,
            device_type: shadow.device_type,
            channel: shadow.channel,
            frequency: shadow.frequency,
            signal_dbm: shadow.signal_dbm,
            encryption: shadow.encryption,
            manuf: shadow.manuf,
            packets_total: shadow.packets_total,
            first_seen: shadow.first_seen,
            last_seen: shadow.last_seen,
            lat: shadow.lat,
            lon: shadow.lon,
            alt: shadow.alt,
            gps_valid: shadow.gps_valid,
            fingerprint_hash: shadow.fingerprint_hash,
            fingerprint_data: shadow.fingerprint_data,
            is_known: shadow.is_known,
            identified_as: shadow.identified_as,
            is_duplicate: shadow.is_duplicate,
            duplicate_of_id: shadow.duplicate_of_id,
            seen_by_nodes: Vec::new(),
        })
    }
}

impl serde::Serialize for BtDevice {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("BtDevice", 15)?;
        s.serialize_field("device_key", &self.device_key)?;
        s.serialize_field("mac", &self.mac)?;
        s.serialize_field("name", &self.name)?;
        s.serialize_field("device_type", &self.device_type)?;
        s.serialize_field("device_class", &self.device_class)?;
        s.serialize_field("rssi", &self.rssi)?;
        s.serialize_field("manuf", &self.manuf)?;
        s.serialize_field("first_seen", &self.first_seen)?;
        s.serialize_field("last_seen", &self.last_seen)?;
        s.serialize_field("lat", &self.lat)?;
        s.serialize_field("lon", &self.lon)?;
        s.serialize_field("alt", &self.alt)?;
        s.serialize_field("gps_valid", &self.gps_valid)?;
        s.serialize_field("fingerprint_hash", &self.fingerprint_hash)?;
        s.serialize_field("is_known", &self.is_known)?;
        s.end()
    }
}

impl<'de> serde::Deserialize<'de> for BtDevice {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Shadow {
            device_key: String,
            mac: String,
            name: Option<String>,
            device_type: String,
            device_class: Option<String>,
            rssi: Option<i32>,
            manuf: Option<String>,
            first_seen: i64,
            last_seen: i64,
            lat: Option<f64>,
            lon: Option<f64>,
            alt: Option<f64>,
            gps_valid: bool,
            fingerprint_hash: Option<String>,
            is_known: bool,
        }
        let shadow = Shadow::deserialize(deserializer)?;
        Ok(BtDevice {
            device_key: shadow.device_key,
            mac: shadow.mac,
            name: shadow.name,
            device_type: shadow.device_type,
            device_class: shadow.device_class,
            rssi: shadow.rssi,
            manuf: shadow.manuf,
            service_uuids: Vec::new(),
            first_seen: shadow.first_seen,
            last_seen: shadow.last_seen,
            lat: shadow.lat,
            lon: shadow.lon,
            alt: shadow.alt,
            gps_valid: shadow.gps_valid,
            fingerprint_hash: shadow.fingerprint_hash,
            is_known: shadow.is_known,
            identified_as: None,
            is_duplicate: false,
            duplicate_of_id: None,
            seen_by_nodes: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_wifi(key: &str, bssid: &str) -> WifiDevice {
        WifiDevice {
            device_key: key.to_string(),
            bssid: bssid.to_string(),
            essid: Some("TestNet".to_string()),
            device_type: "ap".to_string(),
            channel: Some(6),
            frequency: Some(2437),
            signal_dbm: Some(-55),
            packets_total: 10,
            first_seen: 1000,
            last_seen: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn insert_then_upsert_coalesces_text_replaces_numeric() -> Result<()> {
        let store = Store::open_in_memory()?;
        store.create_session("node-1", None, Some("test"))?;
        let session_id = store.get_latest_session()?.unwrap().session_id;

        store.do_insert_wifi(&session_id, &sample_wifi("k1", "aa:bb:cc:dd:ee:ff"))?;

        let mut second = sample_wifi("k1", "aa:bb:cc:dd:ee:ff");
        second.essid = None; // should not clobber existing essid
        second.signal_dbm = Some(-40);
        second.packets_total = 25;
        second.last_seen = 2000;
        store.do_insert_wifi(&session_id, &second)?;

        let (essid, signal, packets, last_seen): (Option<String>, Option<i32>, i64, i64) =
            store.conn.query_row(
                "SELECT essid, signal_dbm, packets_total, last_seen FROM wifi_devices
                 WHERE session_id = ?1 AND device_key = 'k1'",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        assert_eq!(essid.as_deref(), Some("TestNet"));
        assert_eq!(signal, Some(-40));
        assert_eq!(packets, 25);
        assert_eq!(last_seen, 2000);
        Ok(())
    }

    #[test]
    fn signature_increments_times_seen() -> Result<()> {
        let store = Store::open_in_memory()?;
        let sig = FingerprintSignature {
            fingerprint_hash: "a".repeat(64),
            device_type: "wifi".to_string(),
            model: None,
            os_version: None,
            confidence: 0.5,
            identifiers: None,
            first_seen: 1000,
            times_seen: 1,
        };
        store.insert_signature(&sig)?;
        store.insert_signature(&sig)?;
        store.insert_signature(&sig)?;

        let times_seen: i64 = store.conn.query_row(
            "SELECT times_seen FROM fingerprint_signatures WHERE fingerprint_hash = ?1",
            params![sig.fingerprint_hash],
            |row| row.get(0),
        )?;
        assert_eq!(times_seen, 3);
        Ok(())
    }

    #[test]
    fn devices_within_bounding_box() -> Result<()> {
        let store = Store::open_in_memory()?;
        store.create_session("node-1", None, Some("test"))?;
        let session_id = store.get_latest_session()?.unwrap().session_id;

        let mut near = sample_wifi("near", "11:22:33:44:55:66");
        near.lat = Some(33.4484);
        near.lon = Some(-112.0740);
        near.gps_valid = true;
        store.do_insert_wifi(&session_id, &near)?;

        let mut far = sample_wifi("far", "66:55:44:33:22:11");
        far.lat = Some(48.8566);
        far.lon = Some(2.3522);
        far.gps_valid = true;
        store.do_insert_wifi(&session_id, &far)?;

        let results = store.devices_within(33.4484, -112.0740, 1000.0, Some(&session_id))?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "11:22:33:44:55:66");
        Ok(())
    }

    #[test]
    fn buffer_then_drain_replays_and_deletes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("test.db");
        let backup_dir = dir.path().join("backup");
        let store = Store::open(&db_path, &backup_dir, None)?;
        store.create_session("node-1", None, Some("test"))?;
        let session_id = store.get_latest_session()?.unwrap().session_id;

        let device = sample_wifi("buffered", "aa:aa:aa:aa:aa:aa");
        store.buffer_record(BufferedKind::Wifi, &session_id, &device)?;

        let buffered_files: Vec<_> = fs::read_dir(&backup_dir)?.collect();
        assert_eq!(buffered_files.len(), 1);

        let drained = store.drain_buffer()?;
        assert_eq!(drained, 1);

        let remaining: Vec<_> = fs::read_dir(&backup_dir)?.collect();
        assert!(remaining.is_empty());

        let count: i64 = store.conn.query_row(
            "SELECT COUNT(*) FROM wifi_devices WHERE device_key = 'buffered'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[test]
    fn external_device_persists_upstream_daemon_key_not_mac() -> Result<()> {
        use crate::fingerprint::FingerprintEngine;
        use crate::poller::{UpstreamDevice, WifiRecord};
        use std::sync::Arc;

        let store = Arc::new(Store::open_in_memory()?);
        store.create_session("node-1", None, Some("test"))?;
        let session_id = store.get_latest_session()?.unwrap().session_id;

        let engine = FingerprintEngine::new(None, Some(store.clone()), true);
        engine.set_session(session_id.clone());

        engine.on_external_device(&UpstreamDevice::Wifi(WifiRecord {
            key: Some("KISMET-DEVKEY-1".to_string()),
            bssid: "aa:bb:cc:dd:ee:ff".to_string(),
            essid: Some("HomeNet".to_string()),
            signal_dbm: Some(-50),
            channel: Some(6),
            frequency: Some(2437),
            manuf: Some("Acme".to_string()),
            probed_ssids: Vec::new(),
            first_time: Some(1_699_000_000),
            last_time: 1_700_000_000,
        }));

        let device_key: String = store.conn.query_row(
            "SELECT device_key FROM wifi_devices WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        assert_eq!(device_key, "KISMET-DEVKEY-1");
        Ok(())
    }
}
