//! The detect stage as one call per batch.
//!
//! ```text
//! record × active item
//!   ├─ fetch history (timestamps the detectors ask for)
//!   ├─ algorithms in declared order, first anomaly per level wins
//!   ├─ double-check (first matching registered strategy)
//!   ├─ per level: emit anomaly | record normal
//!   └─ remember value in DETECT_HISTORY
//! ```
//!
//! Algorithm failures stay inside one (point, level): they are logged,
//! counted and the level is treated as normal. KV failures skip the
//! current point; an outage past the grace window stops the batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use alarm_core::hashing::{anomaly_id, format_anomaly_time};
use alarm_core::{AlgorithmKind, Anomaly, DataRecord, EventRecord, Item, ItemKey, Level};
use alarm_kv::{KvError, SharedKv};
use alarm_metrics::{DropReason, PipelineMetrics};
use alarm_strategy::{ItemRef, StrategySnapshot};
use tracing::{debug, info, warn};

use crate::algorithms::{self, DetectInput, Detector};
use crate::double_check::{CheckContext, DoubleCheckRegistry};
use crate::emitter::{AnomalyEmitter, Emission};
use crate::error::{DetectError, DetectResult};
use crate::history::{HistoryPoint, HistoryStore};

const STAGE: &str = "detect";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectStats {
    pub points: usize,
    pub events: usize,
    /// Points without any usable value.
    pub skipped: usize,
    pub anomalies: usize,
    pub normals: usize,
    pub algorithm_errors: usize,
    pub double_checked: usize,
    pub kv_errors: usize,
    pub sink_errors: usize,
}

#[derive(Debug, Default)]
pub struct DetectOutput {
    pub stats: DetectStats,
    /// Set when the KV backend has been gone past its grace window.
    pub fatal: Option<KvError>,
}

struct CompiledAlgorithm {
    kind: AlgorithmKind,
    level: Level,
    detector: Result<Box<dyn Detector>, String>,
}

#[derive(Default)]
struct CompiledItems {
    version: u64,
    items: HashMap<ItemKey, Arc<Vec<CompiledAlgorithm>>>,
}

pub struct DetectEngine {
    history: HistoryStore,
    emitter: Arc<AnomalyEmitter>,
    double_check: DoubleCheckRegistry,
    metrics: Arc<PipelineMetrics>,
    compiled: Mutex<CompiledItems>,
}

impl DetectEngine {
    pub fn new(
        kv: SharedKv,
        emitter: Arc<AnomalyEmitter>,
        double_check: DoubleCheckRegistry,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            history: HistoryStore::new(kv),
            emitter,
            double_check,
            metrics,
            compiled: Mutex::new(CompiledItems::default()),
        }
    }

    pub fn emitter(&self) -> &Arc<AnomalyEmitter> {
        &self.emitter
    }

    // ── Points ──────────────────────────────────────────────────

    pub async fn detect_points(
        &self,
        snapshot: &StrategySnapshot,
        records: &[DataRecord],
    ) -> DetectOutput {
        let mut out = DetectOutput::default();
        self.metrics.record_received(STAGE, records.len() as u64);
        let peers = peer_values(records);
        let mut remembered = Vec::with_capacity(records.len());

        for record in records {
            let Some(value) = record.primary_value() else {
                out.stats.skipped += 1;
                self.metrics.record_dropped(STAGE, DropReason::Malformed);
                continue;
            };
            out.stats.points += 1;
            for key in record.matches.active() {
                let Some(item) = snapshot.item(key) else {
                    self.metrics.record_dropped(STAGE, DropReason::StrategyMissing);
                    continue;
                };
                let peer_values = peers
                    .get(&(key, record.time))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let result = self
                    .detect_point(snapshot, item, record, value, peer_values, &mut out.stats)
                    .await;
                if let Err(e) = result {
                    self.failed(&e, &mut out);
                    if out.fatal.is_some() {
                        return out;
                    }
                    continue;
                }
                remembered.push(HistoryPoint {
                    item: key,
                    dimensions_md5: record.dimensions_md5.clone(),
                    time: record.time,
                    value,
                });
            }
        }

        if let Err(e) = self.history.record(&remembered).await {
            warn!(error = %e, points = remembered.len(), "detect history not saved");
            self.failed(&DetectError::Kv(e), &mut out);
        }
        debug!(
            points = out.stats.points,
            anomalies = out.stats.anomalies,
            normals = out.stats.normals,
            "detect batch done"
        );
        out
    }

    async fn detect_point(
        &self,
        snapshot: &StrategySnapshot,
        item_ref: ItemRef<'_>,
        record: &DataRecord,
        value: f64,
        peers: &[f64],
        stats: &mut DetectStats,
    ) -> DetectResult<()> {
        let key = item_ref.key();
        let item = item_ref.item;
        let compiled = self.compiled(snapshot, item_ref);
        let checker = self.double_check.find(key.strategy_id, item);

        let mut times: BTreeSet<i64> = compiled
            .iter()
            .filter_map(|a| a.detector.as_ref().ok())
            .flat_map(|d| d.history_points(record.time, item.interval))
            .collect();
        if checker.is_some() {
            times.insert(record.time - item.interval as i64);
        }
        let times: Vec<i64> = times.into_iter().collect();
        let history = self
            .history
            .fetch(key, &record.dimensions_md5, &times)
            .await?;

        let input = DetectInput {
            value,
            time: record.time,
            interval: item.interval,
            history: &history,
            peers,
        };
        let mut anomalies: Vec<Anomaly> = Vec::new();
        for algorithm in compiled.iter() {
            if anomalies.iter().any(|a| a.level == algorithm.level) {
                continue;
            }
            let outcome = match &algorithm.detector {
                Ok(detector) => detector.detect(&input),
                Err(reason) => Err(DetectError::config(algorithm.kind.as_str(), reason.clone())),
            };
            match outcome {
                Ok(Some(message)) => anomalies.push(Anomaly {
                    level: algorithm.level,
                    anomaly_id: anomaly_id(
                        &record.record_id,
                        key.strategy_id,
                        key.item_id,
                        algorithm.level,
                    ),
                    anomaly_time: format_anomaly_time(record.time),
                    anomaly_message: message,
                    tags: BTreeMap::new(),
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        strategy_id = key.strategy_id,
                        item_id = key.item_id,
                        algorithm = %algorithm.kind,
                        level = %algorithm.level,
                        error = %e,
                        "algorithm failed, level treated as normal"
                    );
                    self.metrics.algorithm_error(algorithm.kind.as_str());
                    stats.algorithm_errors += 1;
                }
            }
        }

        if let Some(checker) = checker.filter(|_| !anomalies.is_empty()) {
            let gate = checker.gate();
            if let Some(target) = gate.get_best_match_algorithm(item) {
                let verdict = checker.double_check(
                    &CheckContext {
                        item,
                        target,
                        value,
                        time: record.time,
                        history: &history,
                    },
                    &mut anomalies,
                );
                self.metrics.double_check(&gate.name, verdict.as_str());
                stats.double_checked += 1;
            }
        }

        let levels: BTreeSet<Level> = compiled.iter().map(|a| a.level).collect();
        if levels.is_empty() {
            self.emitter
                .observe(
                    key,
                    &record.dimensions_md5,
                    &record.dimensions,
                    record.time,
                    item.first_level(),
                )
                .await?;
            return Ok(());
        }
        let mut raised = Vec::new();
        for level in levels {
            match anomalies.iter().find(|a| a.level == level) {
                Some(anomaly) => raised.push(anomaly.clone()),
                None => {
                    self.emitter
                        .record_normal(
                            key,
                            &record.dimensions_md5,
                            &record.dimensions,
                            record.time,
                            level,
                            value,
                        )
                        .await?;
                    stats.normals += 1;
                }
            }
        }
        if !raised.is_empty() {
            let count = raised.len();
            self.emitter
                .emit(&Emission {
                    item: key,
                    dimensions_md5: record.dimensions_md5.clone(),
                    point: record.point(),
                    anomalies: raised,
                    snapshot_key: snapshot.snapshot_key(key.strategy_id),
                })
                .await?;
            stats.anomalies += count;
        }
        Ok(())
    }

    // ── Events ──────────────────────────────────────────────────

    /// Events skip algorithms: every active item emits at the level of
    /// its first algorithm.
    pub async fn detect_events(
        &self,
        snapshot: &StrategySnapshot,
        records: &[EventRecord],
    ) -> DetectOutput {
        let mut out = DetectOutput::default();
        self.metrics.record_received(STAGE, records.len() as u64);
        for record in records {
            out.stats.events += 1;
            let record_id = record.record_id();
            for key in record.matches.active() {
                let Some(item) = snapshot.item(key) else {
                    self.metrics.record_dropped(STAGE, DropReason::StrategyMissing);
                    continue;
                };
                let level = item.item.first_level();
                let emission = Emission {
                    item: key,
                    dimensions_md5: record.md5_dimension.clone(),
                    point: record.point(),
                    anomalies: vec![Anomaly {
                        level,
                        anomaly_id: anomaly_id(&record_id, key.strategy_id, key.item_id, level),
                        anomaly_time: format_anomaly_time(record.time),
                        anomaly_message: event_message(record),
                        tags: BTreeMap::new(),
                    }],
                    snapshot_key: snapshot.snapshot_key(key.strategy_id),
                };
                match self.emitter.emit(&emission).await {
                    Ok(()) => out.stats.anomalies += 1,
                    Err(e) => {
                        self.failed(&e, &mut out);
                        if out.fatal.is_some() {
                            return out;
                        }
                    }
                }
            }
        }
        out
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn compiled(&self, snapshot: &StrategySnapshot, item: ItemRef<'_>) -> Arc<Vec<CompiledAlgorithm>> {
        let mut cache = self.compiled.lock().expect("compiled lock");
        if cache.version != snapshot.version() {
            cache.version = snapshot.version();
            cache.items.clear();
        }
        cache
            .items
            .entry(item.key())
            .or_insert_with(|| Arc::new(compile(item.key(), item.item)))
            .clone()
    }

    fn failed(&self, error: &DetectError, out: &mut DetectOutput) {
        match error {
            DetectError::Kv(e) => {
                out.stats.kv_errors += 1;
                self.metrics.kv_error(STAGE, e.kind());
                let reason = if matches!(e, KvError::Timeout(_)) {
                    DropReason::KvTimeout
                } else {
                    DropReason::KvError
                };
                self.metrics.record_dropped(STAGE, reason);
                if e.is_fatal() && out.fatal.is_none() {
                    info!(error = %e, "kv backend unavailable past grace window");
                    out.fatal = Some(e.clone());
                } else {
                    warn!(error = %e, "point dropped after kv failure");
                }
            }
            other => {
                out.stats.sink_errors += 1;
                warn!(error = %other, "anomaly not delivered");
            }
        }
    }
}

fn compile(key: ItemKey, item: &Item) -> Vec<CompiledAlgorithm> {
    item.algorithms
        .iter()
        .map(|algorithm| {
            let detector = algorithms::build(algorithm).map_err(|e| {
                warn!(
                    strategy_id = key.strategy_id,
                    item_id = key.item_id,
                    algorithm = %algorithm.kind,
                    error = %e,
                    "algorithm config rejected"
                );
                e.to_string()
            });
            CompiledAlgorithm {
                kind: algorithm.kind,
                level: algorithm.level,
                detector,
            }
        })
        .collect()
}

/// Values of every point in the batch, grouped by item and timestamp.
fn peer_values(records: &[DataRecord]) -> HashMap<(ItemKey, i64), Vec<f64>> {
    let mut peers: HashMap<(ItemKey, i64), Vec<f64>> = HashMap::new();
    for record in records {
        let Some(value) = record.primary_value() else {
            continue;
        };
        for key in record.matches.active() {
            peers.entry((key, record.time)).or_default().push(value);
        }
    }
    peers
}

fn event_message(record: &EventRecord) -> String {
    match (record.message.is_empty(), record.event_name.is_empty()) {
        (false, _) => record.message.clone(),
        (true, false) => format!("event {} occurred", record.event_name),
        (true, true) => "event occurred".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alarm_core::config::{CheckResultSettings, DoubleCheckSettings};
    use alarm_core::{AnomalyMessage, ItemMatches, Strategy};
    use alarm_kv::keys::{self, CheckResultKey};
    use alarm_kv::{KvClient, MemoryKv, RetryPolicy, RetryingKv, SingleNode};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::check_result::CheckResultStore;
    use crate::double_check::{
        DoubleCheckGate, DoubleCheckStrategy, Verdict, RESULT_TAG, SUSPECTED_MISSING_POINTS,
    };
    use crate::emitter::ChannelSink;

    struct Harness {
        kv: Arc<MemoryKv>,
        metrics: Arc<PipelineMetrics>,
        engine: DetectEngine,
        rx: mpsc::Receiver<AnomalyMessage>,
        snapshot: StrategySnapshot,
    }

    fn strategies() -> Vec<Strategy> {
        serde_json::from_value(json!([
            { "id": 1, "bk_biz_id": 2, "items": [{
                "id": 11, "interval": 60, "agg_methods": ["SUM"],
                "data_source_labels": ["bk_monitor"], "data_type_labels": ["time_series"],
                "algorithms": [
                    { "type": "Threshold", "level": 1, "config": [[{ "method": "gte", "threshold": 100 }]] },
                    { "type": "Threshold", "level": 2, "config": [[{ "method": "gte", "threshold": 50 }]] },
                    { "type": "SimpleRingRatio", "level": 2, "config": { "ceil": 10 } },
                ]
            }]},
            { "id": 2, "bk_biz_id": 2, "items": [{
                "id": 21, "interval": 60,
                "data_source_labels": ["bk_monitor"], "data_type_labels": ["time_series"],
                "algorithms": [
                    { "type": "IntelligentDetect", "level": 1 },
                    { "type": "Threshold", "level": 2, "config": "broken" },
                ]
            }]},
            { "id": 3, "bk_biz_id": 2, "items": [{
                "id": 31, "interval": 60,
                "data_source_labels": ["bk_monitor"], "data_type_labels": ["time_series"],
                "algorithms": [
                    { "type": "PartialNodes", "level": 3,
                      "config": { "count": 2, "threshold": [[{ "method": "gte", "threshold": 90 }]] } },
                ]
            }]},
            { "id": 4, "bk_biz_id": 2, "items": [{
                "id": 41, "data_source_labels": ["bk_monitor"], "data_type_labels": ["event"],
                "algorithms": [{ "type": "Threshold", "level": 1, "config": [] }]
            }]},
        ]))
        .unwrap()
    }

    fn harness(registry: DoubleCheckRegistry) -> Harness {
        harness_on(Arc::new(MemoryKv::new()), registry)
    }

    fn harness_on(kv: Arc<MemoryKv>, registry: DoubleCheckRegistry) -> Harness {
        let metrics = Arc::new(PipelineMetrics::new());
        let store = Arc::new(CheckResultStore::new(
            Arc::new(SingleNode(kv.clone())),
            &CheckResultSettings {
                max_points: 30,
                ttl_secs: 3600,
            },
        ));
        let (tx, rx) = mpsc::channel(64);
        let emitter = Arc::new(AnomalyEmitter::new(
            store,
            Arc::new(ChannelSink::new(tx)),
            metrics.clone(),
        ));
        let engine = DetectEngine::new(kv.clone(), emitter, registry, metrics.clone());
        let (snapshot, _) = StrategySnapshot::build(strategies(), 1, 0);
        Harness {
            kv,
            metrics,
            engine,
            rx,
            snapshot,
        }
    }

    fn point(item: ItemKey, ip: &str, time: i64, value: f64) -> DataRecord {
        let dims = BTreeMap::from([("ip".to_string(), ip.to_string())]);
        let mut record = DataRecord::new(dims, Some(value), BTreeMap::new(), time);
        record.matches = ItemMatches::new(vec![item]);
        record
    }

    fn drain(rx: &mut mpsc::Receiver<AnomalyMessage>) -> Vec<AnomalyMessage> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn every_level_goes_out_in_one_message() {
        let mut h = harness(DoubleCheckRegistry::new());
        let record = point(ItemKey::new(1, 11), "a", 600, 120.0);
        let out = h.engine.detect_points(&h.snapshot, &[record.clone()]).await;
        assert_eq!(out.stats.anomalies, 2);
        assert_eq!(out.stats.normals, 0);

        let messages = drain(&mut h.rx);
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.trigger.level, Level::Fatal);
        assert_eq!(
            message.trigger.anomaly_ids,
            vec![
                format!("{}.1.11.1", record.record_id),
                format!("{}.1.11.2", record.record_id),
            ]
        );
        assert_eq!(
            message.anomaly.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
        assert!(message.anomaly["2"].anomaly_message.contains(">= 50"));

        for level in [Level::Fatal, Level::Warning] {
            let key = CheckResultKey::new(1, 11, &record.dimensions_md5, level);
            let members = h.kv.zrange_withscores(&key.key(), 0, -1).await.unwrap();
            assert_eq!(members, vec![("600|ANOMALY".to_string(), 600.0)]);
        }
    }

    #[tokio::test]
    async fn normal_levels_are_recorded_with_value() {
        let mut h = harness(DoubleCheckRegistry::new());
        let record = point(ItemKey::new(1, 11), "a", 600, 60.0);
        let out = h.engine.detect_points(&h.snapshot, &[record.clone()]).await;
        assert_eq!(out.stats.anomalies, 1);
        assert_eq!(out.stats.normals, 1);
        assert_eq!(drain(&mut h.rx).len(), 1);

        let key = CheckResultKey::new(1, 11, &record.dimensions_md5, Level::Fatal);
        let members = h.kv.zrange_withscores(&key.key(), 0, -1).await.unwrap();
        assert_eq!(members, vec![("600|60".to_string(), 600.0)]);
    }

    #[tokio::test]
    async fn history_feeds_ring_ratio() {
        let mut h = harness(DoubleCheckRegistry::new());
        let item = ItemKey::new(1, 11);
        h.engine
            .detect_points(&h.snapshot, &[point(item, "a", 540, 10.0)])
            .await;
        let out = h
            .engine
            .detect_points(&h.snapshot, &[point(item, "a", 600, 20.0)])
            .await;
        assert_eq!(out.stats.anomalies, 1);
        let messages = drain(&mut h.rx);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].anomaly["2"].anomaly_message.contains("previous point"));
    }

    #[tokio::test]
    async fn bad_algorithms_count_as_errors_not_anomalies() {
        let mut h = harness(DoubleCheckRegistry::new());
        let out = h
            .engine
            .detect_points(&h.snapshot, &[point(ItemKey::new(2, 21), "a", 600, 1.0)])
            .await;
        assert_eq!(out.stats.algorithm_errors, 2);
        assert_eq!(out.stats.anomalies, 0);
        assert_eq!(out.stats.normals, 2);
        assert!(out.fatal.is_none());
        assert_eq!(h.metrics.algorithm_errors("Unknown"), 1);
        assert_eq!(h.metrics.algorithm_errors("Threshold"), 1);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn partial_nodes_sees_the_whole_batch() {
        let mut h = harness(DoubleCheckRegistry::new());
        let item = ItemKey::new(3, 31);
        let out = h
            .engine
            .detect_points(
                &h.snapshot,
                &[
                    point(item, "a", 600, 95.0),
                    point(item, "b", 600, 92.0),
                    point(item, "c", 600, 10.0),
                ],
            )
            .await;
        assert_eq!(out.stats.anomalies, 2);
        assert_eq!(out.stats.normals, 1);
        assert_eq!(drain(&mut h.rx).len(), 2);
    }

    #[tokio::test]
    async fn missing_value_is_skipped() {
        let h = harness(DoubleCheckRegistry::new());
        let mut record = point(ItemKey::new(1, 11), "a", 600, 1.0);
        record.value = None;
        let out = h.engine.detect_points(&h.snapshot, &[record]).await;
        assert_eq!(out.stats.skipped, 1);
        assert_eq!(out.stats.points, 0);
    }

    #[tokio::test]
    async fn sum_double_check_tags_sharp_drops() {
        let mut h = harness(DoubleCheckRegistry::builtin(&DoubleCheckSettings {
            sum_strategy_ids: vec![1],
        }));
        let item = ItemKey::new(1, 11);
        let out = h
            .engine
            .detect_points(&h.snapshot, &[point(item, "a", 540, 200.0)])
            .await;
        assert_eq!(out.stats.double_checked, 1);
        drain(&mut h.rx);

        let out = h
            .engine
            .detect_points(&h.snapshot, &[point(item, "a", 600, 60.0)])
            .await;
        assert_eq!(out.stats.anomalies, 1);
        assert_eq!(out.stats.double_checked, 1);
        let messages = drain(&mut h.rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].anomaly["2"].tags.get(RESULT_TAG).map(String::as_str),
            Some(SUSPECTED_MISSING_POINTS)
        );
        assert_eq!(h.metrics.double_checks("SumFunctionByMissingPoints", "passed"), 1);
        assert_eq!(h.metrics.double_checks("SumFunctionByMissingPoints", "suspected"), 1);
    }

    struct DropAll(DoubleCheckGate);

    impl DoubleCheckStrategy for DropAll {
        fn gate(&self) -> &DoubleCheckGate {
            &self.0
        }

        fn double_check(&self, _ctx: &CheckContext<'_>, anomalies: &mut Vec<Anomaly>) -> Verdict {
            anomalies.clear();
            Verdict::Dropped
        }
    }

    #[tokio::test]
    async fn vetoed_anomalies_become_normals() {
        let mut registry = DoubleCheckRegistry::new();
        registry.register(Arc::new(DropAll(DoubleCheckGate {
            name: "drop_all".to_string(),
            match_strategy_ids: BTreeSet::from([1]),
            data_scopes: vec![("bk_monitor".to_string(), "time_series".to_string())],
            match_agg_method: None,
            match_algorithms_type_sequence: vec![AlgorithmKind::Threshold],
        })));
        let mut h = harness(registry);
        let out = h
            .engine
            .detect_points(&h.snapshot, &[point(ItemKey::new(1, 11), "a", 600, 120.0)])
            .await;
        assert_eq!(out.stats.anomalies, 0);
        assert_eq!(out.stats.normals, 2);
        assert_eq!(h.metrics.double_checks("drop_all", "dropped"), 1);
        assert!(drain(&mut h.rx).is_empty());
    }

    #[tokio::test]
    async fn events_emit_at_first_level() {
        let mut h = harness(DoubleCheckRegistry::new());
        let mut record = EventRecord::new(BTreeMap::new(), 600);
        record.event_name = "oom".to_string();
        record.matches = ItemMatches::new(vec![ItemKey::new(4, 41)]);
        let out = h.engine.detect_events(&h.snapshot, &[record]).await;
        assert_eq!(out.stats.anomalies, 1);
        let messages = drain(&mut h.rx);
        assert_eq!(messages[0].trigger.level, Level::Fatal);
        assert_eq!(messages[0].anomaly["1"].anomaly_message, "event oom occurred");
    }

    #[tokio::test]
    async fn outage_stops_the_batch() {
        let kv = Arc::new(MemoryKv::new());
        let retrying = Arc::new(RetryingKv::new(
            (*kv).clone(),
            RetryPolicy::new(Duration::from_secs(1), Duration::ZERO),
        ));
        let h = harness_on(kv.clone(), DoubleCheckRegistry::new());
        let engine = DetectEngine::new(
            retrying,
            h.engine.emitter().clone(),
            DoubleCheckRegistry::new(),
            h.metrics.clone(),
        );
        kv.set_down(true);
        let out = engine
            .detect_points(
                &h.snapshot,
                &[
                    point(ItemKey::new(1, 11), "a", 600, 1.0),
                    point(ItemKey::new(1, 11), "b", 600, 1.0),
                ],
            )
            .await;
        assert!(out.fatal.is_some());
        assert_eq!(out.stats.kv_errors, 1);
        kv.set_down(false);
        assert!(h.kv.scan_match(&keys::check_result_pattern(None)).await.unwrap().is_empty());
    }
}
