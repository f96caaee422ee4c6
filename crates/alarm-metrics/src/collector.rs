//! Pipeline counters.
//!
//! Labeled counters are kept as `label values → Arc<AtomicU64>` maps
//! behind a read-write lock; the lock is only taken for writing the
//! first time a label combination is seen.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

/// Why a record (or one of its items) left the pipeline early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    Malformed,
    Expired,
    OutOfRange,
    Duplicate,
    TokenExhausted,
    Inhibited,
    /// The strategy or item was not in the current snapshot.
    StrategyMissing,
    TimePointLimit,
    KvError,
    KvTimeout,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Malformed => "malformed",
            DropReason::Expired => "expired",
            DropReason::OutOfRange => "out_of_range",
            DropReason::Duplicate => "duplicate",
            DropReason::TokenExhausted => "token_exhausted",
            DropReason::Inhibited => "inhibited",
            DropReason::StrategyMissing => "strategy_missing",
            DropReason::TimePointLimit => "time_point_limit",
            DropReason::KvError => "kv_error",
            DropReason::KvTimeout => "kv_timeout",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size / hit / miss counters owned by a local cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    size: AtomicU64,
}

impl CacheStats {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_size(&self, size: usize) {
        self.size.store(size as u64, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Vec<(&'static str, String)>,
    pub value: f64,
}

/// One named metric with all of its label combinations.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

/// A counter family keyed by label values.
struct LabeledCounter {
    name: &'static str,
    help: &'static str,
    kind: MetricKind,
    label_names: &'static [&'static str],
    values: RwLock<BTreeMap<Vec<String>, Arc<AtomicU64>>>,
}

impl LabeledCounter {
    fn new(
        name: &'static str,
        help: &'static str,
        kind: MetricKind,
        label_names: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            kind,
            label_names,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    fn slot(&self, labels: &[&str]) -> Arc<AtomicU64> {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        if let Some(slot) = self.values.read().expect("metrics lock").get(&key) {
            return slot.clone();
        }
        self.values
            .write()
            .expect("metrics lock")
            .entry(key)
            .or_default()
            .clone()
    }

    fn add(&self, labels: &[&str], n: u64) {
        self.slot(labels).fetch_add(n, Ordering::Relaxed);
    }

    fn set(&self, labels: &[&str], v: u64) {
        self.slot(labels).store(v, Ordering::Relaxed);
    }

    fn get(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.values
            .read()
            .expect("metrics lock")
            .get(&key)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn total(&self) -> u64 {
        self.values
            .read()
            .expect("metrics lock")
            .values()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }

    fn family(&self) -> MetricFamily {
        let values = self.values.read().expect("metrics lock");
        let samples = values
            .iter()
            .map(|(label_values, v)| Sample {
                labels: self
                    .label_names
                    .iter()
                    .copied()
                    .zip(label_values.iter().cloned())
                    .collect(),
                value: v.load(Ordering::Relaxed) as f64,
            })
            .collect();
        MetricFamily {
            name: self.name,
            help: self.help,
            kind: self.kind,
            samples,
        }
    }
}

/// Shared by every stage of one process.
pub struct PipelineMetrics {
    received: LabeledCounter,
    dropped: LabeledCounter,
    tokens_exhausted: LabeledCounter,
    anomalies: LabeledCounter,
    kv_errors: LabeledCounter,
    algorithm_errors: LabeledCounter,
    double_check: LabeledCounter,
    assign_matches: LabeledCounter,
    last_cycle: LabeledCounter,
    caches: RwLock<BTreeMap<String, Arc<CacheStats>>>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        use MetricKind::{Counter, Gauge};
        Self {
            received: LabeledCounter::new(
                "alarm_records_received_total",
                "Records accepted into a stage.",
                Counter,
                &["stage"],
            ),
            dropped: LabeledCounter::new(
                "alarm_records_dropped_total",
                "Records dropped, by stage and reason.",
                Counter,
                &["stage", "reason"],
            ),
            tokens_exhausted: LabeledCounter::new(
                "alarm_tokens_exhausted_total",
                "Records dropped because the query group ran out of tokens.",
                Counter,
                &["query_md5"],
            ),
            anomalies: LabeledCounter::new(
                "alarm_anomalies_emitted_total",
                "Anomalies emitted, by level.",
                Counter,
                &["level"],
            ),
            kv_errors: LabeledCounter::new(
                "alarm_kv_errors_total",
                "KV failures surfaced to a component.",
                Counter,
                &["component", "kind"],
            ),
            algorithm_errors: LabeledCounter::new(
                "alarm_algorithm_errors_total",
                "Detection algorithm failures, by algorithm.",
                Counter,
                &["algorithm"],
            ),
            double_check: LabeledCounter::new(
                "alarm_double_check_total",
                "Double-check outcomes, by checker and result.",
                Counter,
                &["checker", "result"],
            ),
            assign_matches: LabeledCounter::new(
                "alarm_assign_matches_total",
                "Subscriptions matched by routed alerts.",
                Counter,
                &["bk_biz_id"],
            ),
            last_cycle: LabeledCounter::new(
                "alarm_last_successful_cycle_timestamp",
                "Unix time of the last successful cycle, by component.",
                Gauge,
                &["component"],
            ),
            caches: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn record_received(&self, stage: &str, n: u64) {
        self.received.add(&[stage], n);
    }

    pub fn record_dropped(&self, stage: &str, reason: DropReason) {
        self.record_dropped_n(stage, reason, 1);
    }

    pub fn record_dropped_n(&self, stage: &str, reason: DropReason, n: u64) {
        if n > 0 {
            self.dropped.add(&[stage, reason.as_str()], n);
        }
    }

    pub fn token_exhausted(&self, query_md5: &str) {
        self.tokens_exhausted.add(&[query_md5], 1);
    }

    pub fn anomaly_emitted(&self, level: u8) {
        self.anomalies.add(&[&level.to_string()], 1);
    }

    pub fn kv_error(&self, component: &str, kind: &str) {
        self.kv_errors.add(&[component, kind], 1);
    }

    pub fn algorithm_error(&self, algorithm: &str) {
        self.algorithm_errors.add(&[algorithm], 1);
    }

    pub fn double_check(&self, checker: &str, result: &str) {
        self.double_check.add(&[checker, result], 1);
    }

    pub fn assign_matched(&self, bk_biz_id: i64, n: u64) {
        self.assign_matches.add(&[&bk_biz_id.to_string()], n);
    }

    /// Stamp `component` as having just completed a cycle.
    pub fn cycle_succeeded(&self, component: &str) {
        self.last_cycle.set(&[component], epoch_secs());
    }

    pub fn register_cache(&self, name: &str, stats: Arc<CacheStats>) {
        self.caches
            .write()
            .expect("metrics lock")
            .insert(name.to_string(), stats);
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn dropped(&self, stage: &str, reason: DropReason) -> u64 {
        self.dropped.get(&[stage, reason.as_str()])
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.total()
    }

    pub fn received(&self, stage: &str) -> u64 {
        self.received.get(&[stage])
    }

    pub fn tokens_exhausted(&self, query_md5: &str) -> u64 {
        self.tokens_exhausted.get(&[query_md5])
    }

    pub fn anomalies_emitted(&self, level: u8) -> u64 {
        self.anomalies.get(&[&level.to_string()])
    }

    pub fn algorithm_errors(&self, algorithm: &str) -> u64 {
        self.algorithm_errors.get(&[algorithm])
    }

    pub fn kv_errors(&self, component: &str, kind: &str) -> u64 {
        self.kv_errors.get(&[component, kind])
    }

    pub fn double_checks(&self, checker: &str, result: &str) -> u64 {
        self.double_check.get(&[checker, result])
    }

    pub fn last_cycle(&self, component: &str) -> Option<u64> {
        Some(self.last_cycle.get(&[component])).filter(|t| *t > 0)
    }

    /// Everything, in a stable order.
    pub fn snapshot(&self) -> Vec<MetricFamily> {
        let mut families = vec![
            self.received.family(),
            self.dropped.family(),
            self.tokens_exhausted.family(),
            self.anomalies.family(),
            self.kv_errors.family(),
            self.algorithm_errors.family(),
            self.double_check.family(),
            self.assign_matches.family(),
            self.last_cycle.family(),
        ];

        let caches = self.caches.read().expect("metrics lock");
        let cache_family = |name: &'static str,
                            help: &'static str,
                            kind: MetricKind,
                            read: fn(&CacheStats) -> u64| MetricFamily {
            name,
            help,
            kind,
            samples: caches
                .iter()
                .map(|(cache, stats)| Sample {
                    labels: vec![("cache", cache.clone())],
                    value: read(stats) as f64,
                })
                .collect(),
        };
        families.push(cache_family(
            "alarm_cache_size",
            "Entries held by a local cache.",
            MetricKind::Gauge,
            CacheStats::size,
        ));
        families.push(cache_family(
            "alarm_cache_hits_total",
            "Local cache hits.",
            MetricKind::Counter,
            CacheStats::hits,
        ));
        families.push(cache_family(
            "alarm_cache_misses_total",
            "Local cache misses.",
            MetricKind::Counter,
            CacheStats::misses,
        ));
        families
    }

    /// Log a one-line summary every `interval` until shutdown.
    pub async fn run_reporter(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_secs = interval.as_secs(), "metrics reporter started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    info!(
                        received = self.received.total(),
                        dropped = self.dropped.total(),
                        anomalies = self.anomalies.total(),
                        kv_errors = self.kv_errors.total(),
                        "pipeline summary"
                    );
                }
                _ = shutdown.changed() => {
                    info!("metrics reporter shutting down");
                    break;
                }
            }
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
