//! Canonical identifiers: `dimensions_md5`, `record_id`, `anomaly_id`.
//!
//! The dimension map is serialized as compact JSON with keys in sorted
//! order (a `BTreeMap` gives us that for free), then md5'ed and
//! hex-encoded. Identical maps therefore hash identically no matter
//! the order their keys arrived in.

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use serde::Serialize;

use crate::types::Level;

pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compact JSON with sorted keys.
pub fn canonical_json<V: Serialize>(map: &BTreeMap<String, V>) -> String {
    serde_json::to_string(map).unwrap_or_default()
}

pub fn dimensions_md5(dimensions: &BTreeMap<String, String>) -> String {
    md5_hex(&canonical_json(dimensions))
}

pub fn record_id(dimensions_md5: &str, timestamp: i64) -> String {
    format!("{dimensions_md5}.{timestamp}")
}

pub fn anomaly_id(record_id: &str, strategy_id: u64, item_id: u64, level: Level) -> String {
    format!("{record_id}.{strategy_id}.{item_id}.{}", level.as_u8())
}

/// `YYYY-mm-dd HH:MM:SS` in UTC, the format downstream consumers expect
/// in `anomaly_time`.
pub fn format_anomaly_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
