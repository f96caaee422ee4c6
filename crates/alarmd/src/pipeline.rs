//! One process worth of pipeline stages, wired together.
//!
//! ```text
//! raw batch ─► AccessPipeline ─► DetectEngine ─► AnomalyEmitter ─► FanoutSink
//!                  ▲    │ deferred                                ├─ OUTBOUND_TOPIC
//!                  └────┘                                         └─ AssignSink ─► ASSIGN_TOPIC
//! ```

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use alarm_access::{AccessOutput, AccessPipeline, AccessStats};
use alarm_assign::{AssignRouter, SubscribeCache, TopologyCache};
use alarm_core::{AlarmConfig, SharedClock};
use alarm_detect::{
    AnomalyEmitter, AnomalySink, CheckResultStore, DetectEngine, DetectOutput, DetectStats,
    DoubleCheckRegistry, FanoutSink, KvPublishSink, NoDataSweeper,
};
use alarm_kv::{KvError, KvRoute, SharedKv};
use alarm_metrics::PipelineMetrics;
use alarm_strategy::{StrategyCache, StrategySource};
use serde_json::Value;
use tracing::debug;

use crate::assign_sink::AssignSink;

const SUBSCRIBE_CACHE_ENTRIES: usize = 4096;
const SUBSCRIBE_CACHE_MAX_AGE: Duration = Duration::from_secs(60);
const TOPOLOGY_CACHE_ENTRIES: usize = 256;
const TOPOLOGY_CACHE_MAX_AGE: Duration = Duration::from_secs(300);

/// Totals for one inbound batch across access and detect.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub received: usize,
    pub malformed: usize,
    pub accepted: usize,
    /// Extra access rounds run for records the time-point limiter deferred.
    pub resumed_rounds: usize,
    pub anomalies: usize,
    pub normals: usize,
    pub fatal: Option<KvError>,
}

impl BatchReport {
    fn absorb_access(&mut self, stats: &AccessStats) {
        self.received += stats.received;
        self.malformed += stats.malformed;
        self.accepted += stats.accepted;
    }

    fn absorb_detect(&mut self, stats: &DetectStats) {
        self.anomalies += stats.anomalies;
        self.normals += stats.normals;
    }
}

pub struct Pipeline {
    pub kv: SharedKv,
    pub strategies: Arc<StrategyCache>,
    pub access: AccessPipeline,
    pub detect: DetectEngine,
    pub store: Arc<CheckResultStore>,
    pub subscriptions: Arc<SubscribeCache>,
    pub router: Arc<AssignRouter>,
    pub sweeper: NoDataSweeper,
    pub metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        config: &AlarmConfig,
        kv: SharedKv,
        route: Arc<dyn KvRoute>,
        source: Arc<dyn StrategySource>,
        clock: SharedClock,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let strategies = Arc::new(StrategyCache::new(source).with_metrics(metrics.clone()));
        let access = AccessPipeline::new(
            kv.clone(),
            strategies.clone(),
            clock.clone(),
            metrics.clone(),
            config,
        );

        let subscriptions = Arc::new(
            SubscribeCache::new(
                kv.clone(),
                NonZeroUsize::new(SUBSCRIBE_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN),
                SUBSCRIBE_CACHE_MAX_AGE,
            )
            .with_metrics(metrics.clone()),
        );
        let topology = Arc::new(TopologyCache::new(
            kv.clone(),
            NonZeroUsize::new(TOPOLOGY_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            TOPOLOGY_CACHE_MAX_AGE,
        ));
        metrics.register_cache("topology", topology.stats());
        let router = Arc::new(
            AssignRouter::new(subscriptions.clone())
                .with_topology(topology)
                .with_metrics(metrics.clone()),
        );

        let sink: Arc<dyn AnomalySink> = Arc::new(FanoutSink(vec![
            Arc::new(KvPublishSink::new(kv.clone(), config.outbound_topic.clone())),
            Arc::new(AssignSink::new(
                strategies.clone(),
                router.clone(),
                kv.clone(),
                config.assign_topic.clone(),
            )),
        ]));
        let store = Arc::new(CheckResultStore::new(route, &config.check_result));
        let emitter = Arc::new(AnomalyEmitter::new(store.clone(), sink, metrics.clone()));
        let detect = DetectEngine::new(
            kv.clone(),
            emitter.clone(),
            DoubleCheckRegistry::builtin(&config.double_check),
            metrics.clone(),
        );
        let sweeper = NoDataSweeper::new(strategies.clone(), emitter, clock, metrics.clone());

        Self {
            kv,
            strategies,
            access,
            detect,
            store,
            subscriptions,
            router,
            sweeper,
            metrics,
        }
    }

    /// Run a batch of raw points through access and detect. Records the
    /// time-point limiter defers are resumed until none are left.
    pub async fn process_points(&self, raw: &[Value]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut access = self.access.ingest_points(raw).await;
        loop {
            report.absorb_access(&access.stats);
            if self.stop_on_fatal(&mut report, &mut access) {
                return report;
            }
            let detected = self
                .detect
                .detect_points(&access.snapshot, &access.records)
                .await;
            if self.absorb_detect(&mut report, detected) {
                return report;
            }
            if access.deferred.is_empty() {
                break;
            }
            report.resumed_rounds += 1;
            let deferred = std::mem::take(&mut access.deferred);
            debug!(deferred = deferred.len(), "resuming deferred records");
            access = self.access.resume_points(deferred).await;
        }
        report
    }

    pub async fn process_events(&self, raw: &[Value]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut access = self.access.ingest_events(raw).await;
        report.absorb_access(&access.stats);
        if self.stop_on_fatal(&mut report, &mut access) {
            return report;
        }
        let detected = self
            .detect
            .detect_events(&access.snapshot, &access.records)
            .await;
        self.absorb_detect(&mut report, detected);
        report
    }

    fn stop_on_fatal<R>(
        &self,
        report: &mut BatchReport,
        access: &mut AccessOutput<R>,
    ) -> bool {
        report.fatal = access.fatal.take();
        report.fatal.is_some()
    }

    fn absorb_detect(&self, report: &mut BatchReport, detected: DetectOutput) -> bool {
        report.absorb_detect(&detected.stats);
        report.fatal = detected.fatal;
        report.fatal.is_some()
    }
}
