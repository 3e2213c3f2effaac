//! Shared utilities: MAC normalization/matching, haversine distance,
//! session id generation, and canonical-JSON SHA-256 hashing.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Normalize a MAC address to upper-case colon form (`AA:BB:CC:DD:EE:FF`).
///
/// Non-hex separators are stripped before re-inserting colons. Inputs
/// that don't resolve to exactly 12 hex digits are returned unchanged,
/// matching the reference behavior (normalize is idempotent either way).
pub fn normalize_mac(mac: &str) -> String {
    let clean: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if clean.len() != 12 {
        return mac.to_string();
    }

    clean
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap())
        .collect::<Vec<_>>()
        .join(":")
}

/// Check whether a MAC matches an exact or wildcard (`AA:BB:*`) pattern.
pub fn mac_matches_pattern(mac: &str, pattern: &str) -> bool {
    let mac = normalize_mac(mac);
    let pattern = pattern.to_ascii_uppercase().replace('-', ":");

    if !pattern.contains('*') {
        return mac == pattern;
    }

    let prefix = pattern.trim_end_matches('*').trim_end_matches(':');
    mac.starts_with(prefix)
}

/// The "locally administered" bit (0x02) of the MAC's first octet.
///
/// A property of the MAC alone; never panics on malformed input.
pub fn is_randomized_mac(mac: &str) -> bool {
    let clean: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if clean.len() < 2 {
        return false;
    }
    match u8::from_str_radix(&clean[0..2], 16) {
        Ok(first_byte) => first_byte & 0x02 != 0,
        Err(_) => false,
    }
}

/// Great-circle distance between two lat/lon points, in meters.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Generate a session id in the form `{prefix}_{YYYYMMDD}_{HHMMSS}`,
/// defaulting to `airdump_scan` when no prefix is given.
pub fn generate_session_id(prefix: Option<&str>) -> String {
    let now = Utc::now();
    let date = now.format("%Y%m%d");
    let time = now.format("%H%M%S");
    match prefix {
        Some(p) if !p.is_empty() => format!("{p}_{date}_{time}"),
        _ => format!("airdump_scan_{date}_{time}"),
    }
}

/// Canonicalize a JSON value (sort object keys lexicographically, sort
/// arrays of scalars ascending) and SHA-256 hash the UTF-8 serialization,
/// returning 64 lowercase hex characters.
///
/// Callers are expected to have already sorted any array fields that
/// carry set semantics (rates, OUIs, UUIDs); this only guarantees key
/// order, which `serde_json::Value`'s `Map` does not guarantee on its
/// own once built from arbitrary insertion order.
pub fn canonical_json_sha256(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonical json is always serializable");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_inserts_colons_and_upcases() {
        assert_eq!(normalize_mac("aabbccddeeff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_mac("aa-bb-cc-dd-ee-ff"), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["aabbccddeeff", "AA:BB:CC:DD:EE:FF", "not-a-mac", ""] {
            let once = normalize_mac(input);
            let twice = normalize_mac(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn normalize_passes_through_invalid_length() {
        assert_eq!(normalize_mac("AA:BB"), "AA:BB");
    }

    #[test]
    fn pattern_matching() {
        assert!(mac_matches_pattern("AA:BB:CC:DD:EE:FF", "AA:BB:CC:DD:EE:FF"));
        assert!(mac_matches_pattern("AA:BB:CC:DD:EE:FF", "AA:BB:*"));
        assert!(!mac_matches_pattern("AA:BB:CC:DD:EE:FF", "11:22:*"));
    }

    #[test]
    fn randomized_mac_bit_pattern() {
        assert!(is_randomized_mac("02:AA:BB:CC:DD:01"));
        assert!(is_randomized_mac("06:00:00:00:00:00"));
        assert!(is_randomized_mac("0A:00:00:00:00:00"));
        assert!(is_randomized_mac("0E:00:00:00:00:00"));
        assert!(is_randomized_mac("42:00:00:00:00:00"));
        assert!(!is_randomized_mac("00:00:00:00:00:00"));
        assert!(!is_randomized_mac("A0:00:00:00:00:00"));
        assert!(!is_randomized_mac(""));
    }

    #[test]
    fn haversine_identity_and_known_distance() {
        assert_eq!(haversine_distance(51.5, -0.1, 51.5, -0.1), 0.0);

        // London <-> Paris, roughly 343.5km
        let d = haversine_distance(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((d - 343_500.0).abs() / 343_500.0 < 0.02);
    }

    #[test]
    fn session_id_format() {
        let id = generate_session_id(None);
        assert!(id.starts_with("airdump_scan_"));
        let id = generate_session_id(Some("airdump_scan"));
        assert!(id.starts_with("airdump_scan_"));
    }

    #[test]
    fn canonical_hash_is_order_independent() {
        let a = serde_json::json!({"b": 1, "a": [3, 1, 2]});
        let b = serde_json::json!({"a": [3, 1, 2], "b": 1});
        assert_eq!(canonical_json_sha256(&a), canonical_json_sha256(&b));
        assert_eq!(canonical_json_sha256(&a).len(), 64);
    }
}
