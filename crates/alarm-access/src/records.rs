//! Raw JSON → typed records.
//!
//! Inbound points look like
//!
//! ```text
//! { "query_md5": "qm1",            // or "strategy_id" (+ optional "item_id")
//!   "time": 1700000000,            // seconds; millisecond stamps are scaled down
//!   "value": 12.5,                 // or "values": { "metric": 12.5 }
//!   "dimensions": { "ip": "10.0.0.1", "bk_cloud_id": 0 } }
//! ```
//!
//! Events carry `event_name` and `message` instead of values. Scalar
//! dimension values are stringified; nested values are kept as JSON text.

use std::collections::BTreeMap;

use alarm_core::{DataRecord, EventRecord, ItemKey, ItemMatches, StrategyId};
use alarm_strategy::StrategySnapshot;
use serde_json::Value;

use crate::error::{AccessError, AccessResult};

/// Timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: i64 = 10_000_000_000;

/// How a record names the items it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordRoute {
    pub query_md5: Option<String>,
    pub strategy_id: Option<StrategyId>,
    pub item_id: Option<u64>,
}

impl RecordRoute {
    fn from_json(obj: &serde_json::Map<String, Value>) -> AccessResult<Self> {
        let route = Self {
            query_md5: obj
                .get("query_md5")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            strategy_id: obj.get("strategy_id").and_then(as_u64),
            item_id: obj.get("item_id").and_then(as_u64),
        };
        if route.query_md5.is_none() && route.strategy_id.is_none() {
            return Err(AccessError::Malformed(
                "record names neither query_md5 nor strategy_id".to_string(),
            ));
        }
        Ok(route)
    }

    /// Items in `snapshot` this route selects. Event routes only select
    /// event items and point routes only the others.
    pub fn match_items(&self, snapshot: &StrategySnapshot, events: bool) -> Vec<ItemKey> {
        let keep = |item: &alarm_core::Item| {
            item.is_event() == events && self.item_id.is_none_or(|id| id == item.id)
        };
        match (self.strategy_id, &self.query_md5) {
            (Some(sid), _) => snapshot
                .items_of(sid)
                .filter(|r| keep(r.item))
                .map(|r| r.key())
                .collect(),
            (None, Some(qmd5)) => snapshot
                .by_query_md5(qmd5)
                .filter(|r| keep(r.item))
                .map(|r| r.key())
                .collect(),
            (None, None) => Vec::new(),
        }
    }
}

/// Parse one point and match it against `snapshot`.
pub fn parse_point(raw: &Value, snapshot: &StrategySnapshot) -> AccessResult<DataRecord> {
    let obj = raw
        .as_object()
        .ok_or_else(|| AccessError::Malformed("point is not an object".to_string()))?;
    let route = RecordRoute::from_json(obj)?;
    let time = parse_time(obj.get("time"))?;
    let dimensions = parse_dimensions(obj.get("dimensions"))?;

    let value = match obj.get("value") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            as_f64(v).ok_or_else(|| AccessError::Malformed(format!("non-numeric value {v}")))?,
        ),
    };
    let mut values = BTreeMap::new();
    if let Some(Value::Object(map)) = obj.get("values") {
        for (name, v) in map {
            if let Some(n) = as_f64(v) {
                values.insert(name.clone(), n);
            }
        }
    }
    if value.is_none() && values.is_empty() {
        return Err(AccessError::Malformed("point carries no value".to_string()));
    }

    let mut record = DataRecord::new(dimensions, value, values, time);
    if record.dimensions.is_empty() {
        if let Some(dmd5) = obj.get("dimensions_md5").and_then(Value::as_str) {
            record.dimensions_md5 = dmd5.to_string();
            record.record_id = alarm_core::record_id(dmd5, time);
        }
    }
    record.matches = ItemMatches::new(route.match_items(snapshot, false));
    Ok(record)
}

/// Parse one event and match it against `snapshot`.
pub fn parse_event(raw: &Value, snapshot: &StrategySnapshot) -> AccessResult<EventRecord> {
    let obj = raw
        .as_object()
        .ok_or_else(|| AccessError::Malformed("event is not an object".to_string()))?;
    let route = RecordRoute::from_json(obj)?;
    let time = parse_time(obj.get("time"))?;
    let dimensions = parse_dimensions(obj.get("dimensions"))?;

    let mut record = EventRecord::new(dimensions, time);
    if let Some(name) = obj.get("event_name").and_then(Value::as_str) {
        record.event_name = name.to_string();
    }
    if let Some(message) = obj.get("message").and_then(Value::as_str) {
        record.message = message.to_string();
    }
    record.matches = ItemMatches::new(route.match_items(snapshot, true));
    Ok(record)
}

/// `dimensions_md5` of a raw point or event, computed the way
/// [`parse_point`] computes it. A caller-supplied `dimensions_md5` is used
/// when the record has no dimensions. `None` when the dimensions are
/// malformed.
pub fn series_md5(raw: &Value) -> Option<String> {
    let dimensions = parse_dimensions(raw.get("dimensions")).ok()?;
    if dimensions.is_empty() {
        if let Some(dmd5) = raw.get("dimensions_md5").and_then(Value::as_str) {
            return Some(dmd5.to_string());
        }
    }
    Some(alarm_core::dimensions_md5(&dimensions))
}

fn parse_time(raw: Option<&Value>) -> AccessResult<i64> {
    let raw = raw.ok_or_else(|| AccessError::Malformed("missing time".to_string()))?;
    let secs = as_f64(raw)
        .filter(|t| t.is_finite() && *t >= 0.0)
        .ok_or_else(|| AccessError::Malformed(format!("invalid time {raw}")))? as i64;
    Ok(if secs > MILLIS_THRESHOLD { secs / 1000 } else { secs })
}

fn parse_dimensions(raw: Option<&Value>) -> AccessResult<BTreeMap<String, String>> {
    match raw {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), dimension_string(v)))
            .collect()),
        Some(other) => Err(AccessError::Malformed(format!(
            "dimensions must be an object, got {other}"
        ))),
    }
}

fn dimension_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
