//! Shared types used across the alarm pipeline crates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hashing;

pub type StrategyId = u64;
pub type ItemId = u64;

// ── Levels and algorithms ──────────────────────────────────────

/// Alarm severity. 1 is the most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Level {
    Fatal = 1,
    #[default]
    Warning = 2,
    Reminder = 3,
}

impl Level {
    pub const ALL: [Level; 3] = [Level::Fatal, Level::Warning, Level::Reminder];

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Level {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Level::Fatal),
            2 => Ok(Level::Warning),
            3 => Ok(Level::Reminder),
            other => Err(format!("invalid level: {other}")),
        }
    }
}

impl From<Level> for u8 {
    fn from(level: Level) -> u8 {
        level.as_u8()
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlgorithmKind {
    Threshold,
    SimpleRingRatio,
    AdvancedRingRatio,
    SimpleYearRound,
    AdvancedYearRound,
    PartialNodes,
    /// Anything this build does not know how to run.
    #[serde(other)]
    Unknown,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::Threshold => "Threshold",
            AlgorithmKind::SimpleRingRatio => "SimpleRingRatio",
            AlgorithmKind::AdvancedRingRatio => "AdvancedRingRatio",
            AlgorithmKind::SimpleYearRound => "SimpleYearRound",
            AlgorithmKind::AdvancedYearRound => "AdvancedYearRound",
            AlgorithmKind::PartialNodes => "PartialNodes",
            AlgorithmKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detection step of an item. `config` is kept as raw JSON and
/// parsed by the detector for `kind`, so a bad config only fails the
/// level it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Algorithm {
    #[serde(rename = "type")]
    pub kind: AlgorithmKind,
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub config: serde_json::Value,
}

// ── Strategy model ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoDataConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Number of consecutive silent periods before raising no-data.
    #[serde(default = "default_continuous")]
    pub continuous: u32,
    #[serde(default)]
    pub level: Level,
}

fn default_continuous() -> u32 {
    5
}

impl Default for NoDataConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            continuous: default_continuous(),
            level: Level::default(),
        }
    }
}

/// Inclusive bounds on accepted values.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub agg_methods: BTreeSet<String>,
    /// Aggregation interval in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub algorithms: Vec<Algorithm>,
    #[serde(default)]
    pub data_source_labels: BTreeSet<String>,
    #[serde(default)]
    pub data_type_labels: BTreeSet<String>,
    #[serde(default)]
    pub query_md5: String,
    #[serde(default)]
    pub no_data: NoDataConfig,
    #[serde(default)]
    pub value_range: Option<ValueRange>,
}

fn default_interval() -> u64 {
    60
}

impl Item {
    pub fn is_time_series(&self) -> bool {
        self.data_type_labels.contains("time_series")
    }

    pub fn is_event(&self) -> bool {
        self.data_type_labels.contains("event") || self.data_type_labels.contains("log")
    }

    /// Every `(source_label, type_label)` pair this item covers.
    pub fn data_scopes(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.data_source_labels.iter().flat_map(move |source| {
            self.data_type_labels
                .iter()
                .map(move |kind| (source.as_str(), kind.as_str()))
        })
    }

    /// Level of the first configured algorithm, used for events.
    pub fn first_level(&self) -> Level {
        self.algorithms
            .first()
            .map(|a| a.level)
            .unwrap_or_default()
    }

    pub fn has_algorithm(&self, kind: AlgorithmKind) -> bool {
        self.algorithms.iter().any(|a| a.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: StrategyId,
    pub bk_biz_id: i64,
    #[serde(default)]
    pub name: String,
    /// 0 is the lowest priority.
    #[serde(default)]
    pub priority: i64,
    /// Empty means this strategy never takes part in priority dedup.
    #[serde(default)]
    pub priority_group_key: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub items: Vec<Item>,
}

impl Strategy {
    pub fn item(&self, item_id: ItemId) -> Option<&Item> {
        self.items.iter().find(|i| i.id == item_id)
    }

    pub fn in_priority_group(&self) -> bool {
        !self.priority_group_key.is_empty()
    }
}

/// Stable reference from a record to one item of one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub strategy_id: StrategyId,
    pub item_id: ItemId,
}

impl ItemKey {
    pub fn new(strategy_id: StrategyId, item_id: ItemId) -> Self {
        Self {
            strategy_id,
            item_id,
        }
    }
}

// ── Records ────────────────────────────────────────────────────

/// The items a record was matched to and what the access stage decided
/// for each of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMatches {
    pub items: Vec<ItemKey>,
    pub is_retains: HashMap<ItemId, bool>,
    pub inhibitions: HashMap<ItemId, bool>,
}

impl ItemMatches {
    pub fn new(items: Vec<ItemKey>) -> Self {
        let is_retains = items.iter().map(|k| (k.item_id, true)).collect();
        let inhibitions = items.iter().map(|k| (k.item_id, false)).collect();
        Self {
            items,
            is_retains,
            inhibitions,
        }
    }

    pub fn set_retained(&mut self, item_id: ItemId, retained: bool) {
        self.is_retains.insert(item_id, retained);
    }

    pub fn set_inhibited(&mut self, item_id: ItemId, inhibited: bool) {
        self.inhibitions.insert(item_id, inhibited);
    }

    pub fn is_inhibited(&self, item_id: ItemId) -> bool {
        self.inhibitions.get(&item_id).copied().unwrap_or(false)
    }

    /// Retained and not inhibited.
    pub fn is_active(&self, item_id: ItemId) -> bool {
        self.is_retains.get(&item_id).copied().unwrap_or(false) && !self.is_inhibited(item_id)
    }

    pub fn active(&self) -> impl Iterator<Item = ItemKey> + '_ {
        self.items.iter().copied().filter(|k| self.is_active(k.item_id))
    }

    pub fn has_active(&self) -> bool {
        self.active().next().is_some()
    }
}

/// One metric point.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub record_id: String,
    pub dimensions_md5: String,
    pub value: Option<f64>,
    pub values: BTreeMap<String, f64>,
    pub dimensions: BTreeMap<String, String>,
    pub time: i64,
    pub matches: ItemMatches,
    /// Set by the duplicate filter when the point was seen before but is
    /// kept around for priority bookkeeping.
    pub is_duplicate: bool,
}

impl DataRecord {
    pub fn new(
        dimensions: BTreeMap<String, String>,
        value: Option<f64>,
        values: BTreeMap<String, f64>,
        time: i64,
    ) -> Self {
        let dimensions_md5 = hashing::dimensions_md5(&dimensions);
        Self {
            record_id: hashing::record_id(&dimensions_md5, time),
            dimensions_md5,
            value,
            values,
            dimensions,
            time,
            matches: ItemMatches::default(),
            is_duplicate: false,
        }
    }

    /// Primary value: `value`, else the single entry of `values`.
    pub fn primary_value(&self) -> Option<f64> {
        self.value.or_else(|| {
            if self.values.len() == 1 {
                self.values.values().next().copied()
            } else {
                self.values.get("value").copied()
            }
        })
    }

    pub fn point(&self) -> PointData {
        PointData {
            record_id: self.record_id.clone(),
            value: self.primary_value(),
            values: self.values.clone(),
            dimensions: self.dimensions.clone(),
            time: self.time,
        }
    }
}

/// One event occurrence. Events carry no value and skip algorithms.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub md5_dimension: String,
    pub dimensions: BTreeMap<String, String>,
    pub time: i64,
    pub event_name: String,
    pub message: String,
    pub matches: ItemMatches,
}

impl EventRecord {
    pub fn new(dimensions: BTreeMap<String, String>, time: i64) -> Self {
        Self {
            md5_dimension: hashing::dimensions_md5(&dimensions),
            dimensions,
            time,
            event_name: String::new(),
            message: String::new(),
            matches: ItemMatches::default(),
        }
    }

    pub fn record_id(&self) -> String {
        hashing::record_id(&self.md5_dimension, self.time)
    }

    pub fn point(&self) -> PointData {
        PointData {
            record_id: self.record_id(),
            value: None,
            values: BTreeMap::new(),
            dimensions: self.dimensions.clone(),
            time: self.time,
        }
    }
}

/// Access-stage view shared by points and events.
pub trait AccessRecord {
    fn dimensions_md5(&self) -> &str;
    fn time(&self) -> i64;
    fn matches(&self) -> &ItemMatches;
    fn matches_mut(&mut self) -> &mut ItemMatches;
}

impl AccessRecord for DataRecord {
    fn dimensions_md5(&self) -> &str {
        &self.dimensions_md5
    }
    fn time(&self) -> i64 {
        self.time
    }
    fn matches(&self) -> &ItemMatches {
        &self.matches
    }
    fn matches_mut(&mut self) -> &mut ItemMatches {
        &mut self.matches
    }
}

impl AccessRecord for EventRecord {
    fn dimensions_md5(&self) -> &str {
        &self.md5_dimension
    }
    fn time(&self) -> i64 {
        self.time
    }
    fn matches(&self) -> &ItemMatches {
        &self.matches
    }
    fn matches_mut(&mut self) -> &mut ItemMatches {
        &mut self.matches
    }
}

// ── Anomalies and outbound messages ────────────────────────────

/// Detection output for one (point, level).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub level: Level,
    pub anomaly_id: String,
    pub anomaly_time: String,
    pub anomaly_message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointData {
    pub record_id: String,
    pub value: Option<f64>,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetail {
    pub anomaly_id: String,
    pub anomaly_time: String,
    pub anomaly_message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub level: Level,
    pub anomaly_ids: Vec<String>,
}

/// The JSON document published on the outbound alert-event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyMessage {
    pub data: PointData,
    /// Keyed by level, as a string.
    pub anomaly: BTreeMap<String, AnomalyDetail>,
    pub strategy_snapshot_key: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub strategy_id: StrategyId,
    #[serde(default)]
    pub item_id: ItemId,
}

impl AnomalyMessage {
    /// One message for every level `anomalies` raised on a point. The
    /// trigger carries the most severe level, and its anomaly id leads
    /// `anomaly_ids`.
    pub fn new(
        point: PointData,
        anomalies: &[Anomaly],
        item: ItemKey,
        snapshot_key: String,
    ) -> Self {
        let mut ordered: Vec<&Anomaly> = anomalies.iter().collect();
        ordered.sort_by_key(|a| a.level);
        let levels = ordered
            .iter()
            .map(|a| {
                (
                    a.level.to_string(),
                    AnomalyDetail {
                        anomaly_id: a.anomaly_id.clone(),
                        anomaly_time: a.anomaly_time.clone(),
                        anomaly_message: a.anomaly_message.clone(),
                        tags: a.tags.clone(),
                    },
                )
            })
            .collect();
        Self {
            data: point,
            anomaly: levels,
            strategy_snapshot_key: snapshot_key,
            trigger: Trigger {
                level: ordered.first().map(|a| a.level).unwrap_or_default(),
                anomaly_ids: ordered.iter().map(|a| a.anomaly_id.clone()).collect(),
            },
            strategy_id: item.strategy_id,
            item_id: item.item_id,
        }
    }
}

// ── Alerts ─────────────────────────────────────────────────────

/// The view of an alert that assignment rules are evaluated against.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub anomaly_id: String,
    pub bk_biz_id: i64,
    #[serde(default)]
    pub strategy_id: StrategyId,
    #[serde(default)]
    pub alert_name: String,
    #[serde(default)]
    pub severity: Level,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub data_source_labels: Vec<String>,
    /// `bk_obj_id|bk_inst_id` pairs of the CMDB nodes the target sits in;
    /// `None` when topology was never resolved for this alert.
    #[serde(default)]
    pub topo_nodes: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Level::Fatal).unwrap(), "1");
        let lvl: Level = serde_json::from_str("3").unwrap();
        assert_eq!(lvl, Level::Reminder);
        assert!(serde_json::from_str::<Level>("4").is_err());
    }

    #[test]
    fn unknown_algorithm_kind_parses() {
        let algo: Algorithm =
            serde_json::from_str(r#"{"type":"IntelligentDetect","level":1}"#).unwrap();
        assert_eq!(algo.kind, AlgorithmKind::Unknown);
        assert_eq!(algo.level, Level::Fatal);
        assert!(algo.config.is_null());
    }

    #[test]
    fn strategy_parses_with_defaults() {
        let json = r#"{
            "id": 1, "bk_biz_id": 2,
            "items": [{
                "id": 11,
                "query_md5": "qm1",
                "data_source_labels": ["bk_monitor"],
                "data_type_labels": ["time_series"],
                "algorithms": [{"type": "Threshold", "level": 2,
                    "config": [[{"method": "gte", "threshold": 10}]]}]
            }]
        }"#;
        let s: Strategy = serde_json::from_str(json).unwrap();
        assert_eq!(s.priority, 0);
        assert!(!s.in_priority_group());
        let item = s.item(11).unwrap();
        assert_eq!(item.interval, 60);
        assert!(item.is_time_series());
        assert_eq!(item.first_level(), Level::Warning);
        assert_eq!(
            item.data_scopes().collect::<Vec<_>>(),
            vec![("bk_monitor", "time_series")]
        );
        assert!(!item.no_data.enabled);
        assert_eq!(item.no_data.continuous, 5);
    }

    #[test]
    fn value_range_bounds_are_inclusive() {
        let r = ValueRange {
            min: Some(0.0),
            max: Some(100.0),
        };
        assert!(r.contains(0.0));
        assert!(r.contains(100.0));
        assert!(!r.contains(-0.1));
        assert!(!r.contains(100.1));
        assert!(ValueRange::default().contains(f64::MAX));
    }

    #[test]
    fn item_matches_track_active_items() {
        let mut m = ItemMatches::new(vec![ItemKey::new(1, 11), ItemKey::new(2, 21)]);
        assert!(m.has_active());
        m.set_inhibited(11, true);
        m.set_retained(21, false);
        assert!(!m.has_active());
        assert!(m.is_inhibited(11));
        assert!(!m.is_active(99));
    }

    #[test]
    fn data_record_ids() {
        let mut dims = BTreeMap::new();
        dims.insert("ip".to_string(), "10.0.0.1".to_string());
        let r = DataRecord::new(dims, Some(1.5), BTreeMap::new(), 1000);
        assert_eq!(r.record_id, format!("{}.1000", r.dimensions_md5));
        assert_eq!(r.primary_value(), Some(1.5));
    }

    #[test]
    fn primary_value_falls_back_to_values() {
        let mut values = BTreeMap::new();
        values.insert("cpu".to_string(), 3.0);
        let r = DataRecord::new(BTreeMap::new(), None, values, 10);
        assert_eq!(r.primary_value(), Some(3.0));
    }

    fn anomaly(level: Level, message: &str) -> Anomaly {
        Anomaly {
            level,
            anomaly_id: format!("d.1000.1.11.{}", level.as_u8()),
            anomaly_time: "1970-01-01 00:16:40".to_string(),
            anomaly_message: message.to_string(),
            tags: BTreeMap::new(),
        }
    }

    fn point() -> PointData {
        PointData {
            record_id: "d.1000".to_string(),
            value: Some(12.0),
            values: BTreeMap::new(),
            dimensions: BTreeMap::new(),
            time: 1000,
        }
    }

    #[test]
    fn anomaly_message_shape() {
        let anomalies = [anomaly(Level::Warning, "value >= 10")];
        let msg = AnomalyMessage::new(point(), &anomalies, ItemKey::new(1, 11), "snap".to_string());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["anomaly"]["2"]["anomaly_id"], "d.1000.1.11.2");
        assert_eq!(json["trigger"]["level"], 2);
        assert_eq!(json["trigger"]["anomaly_ids"][0], "d.1000.1.11.2");
        assert_eq!(json["strategy_snapshot_key"], "snap");
        assert!(json["anomaly"]["2"].get("tags").is_none());
    }

    #[test]
    fn message_covers_every_level_and_triggers_on_the_worst() {
        let anomalies = [
            anomaly(Level::Reminder, "value >= 5"),
            anomaly(Level::Fatal, "value >= 100"),
            anomaly(Level::Warning, "value >= 50"),
        ];
        let msg = AnomalyMessage::new(point(), &anomalies, ItemKey::new(1, 11), "snap".to_string());
        assert_eq!(
            msg.anomaly.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["1", "2", "3"]
        );
        assert_eq!(msg.trigger.level, Level::Fatal);
        assert_eq!(
            msg.trigger.anomaly_ids,
            vec!["d.1000.1.11.1", "d.1000.1.11.2", "d.1000.1.11.3"]
        );
    }
}
