//! No-data detection.
//!
//! For every item with `no_data.enabled`, each period the sweeper walks
//! the dimensions the item has seen (`MD5_TO_DIM`) and compares their
//! newest checkpoint against the check time:
//!
//! ```text
//!   last point          check time (aligned to interval)
//!       │◄── continuous × interval ──►│
//!       ●─────────────────────────────┤  → "no data for N periods"
//! ```
//!
//! The `__latest_no_data_check_point__` cursor makes a sweep run at most
//! once per period. Dimensions silent for longer than the check-result
//! TTL are forgotten.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alarm_core::hashing::{anomaly_id, format_anomaly_time, record_id};
use alarm_core::{Anomaly, PointData, SharedClock};
use alarm_kv::keys::LATEST_NO_DATA_CHECK_POINT;
use alarm_metrics::PipelineMetrics;
use alarm_strategy::{ItemRef, StrategyCache, StrategySnapshot};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::emitter::{AnomalyEmitter, Emission};
use crate::error::{DetectError, DetectResult};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NoDataStats {
    pub items: usize,
    /// Items already swept for the current period.
    pub skipped: usize,
    pub dimensions: usize,
    pub silent: usize,
    pub removed: usize,
    pub errors: usize,
}

pub struct NoDataSweeper {
    strategies: Arc<StrategyCache>,
    emitter: Arc<AnomalyEmitter>,
    clock: SharedClock,
    metrics: Arc<PipelineMetrics>,
}

impl NoDataSweeper {
    pub fn new(
        strategies: Arc<StrategyCache>,
        emitter: Arc<AnomalyEmitter>,
        clock: SharedClock,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            strategies,
            emitter,
            clock,
            metrics,
        }
    }

    /// One pass over every no-data item. Only a KV outage past the grace
    /// window is returned as an error; anything else is logged per item.
    pub async fn sweep(&self) -> DetectResult<NoDataStats> {
        let snapshot = self.strategies.snapshot();
        let now = self.clock.now_secs();
        let mut stats = NoDataStats::default();

        let items = snapshot
            .all_items()
            .filter(|r| r.item.no_data.enabled && !r.item.is_event());
        for item in items {
            stats.items += 1;
            match self.sweep_item(&snapshot, item, now, &mut stats).await {
                Ok(()) => {}
                Err(DetectError::Kv(e)) if e.is_fatal() => return Err(DetectError::Kv(e)),
                Err(e) => {
                    stats.errors += 1;
                    if let DetectError::Kv(kv) = &e {
                        self.metrics.kv_error("nodata", kv.kind());
                    }
                    warn!(
                        strategy_id = item.strategy.id,
                        item_id = item.item.id,
                        error = %e,
                        "no-data check failed"
                    );
                }
            }
        }

        self.metrics.cycle_succeeded("nodata");
        info!(
            items = stats.items,
            skipped = stats.skipped,
            dimensions = stats.dimensions,
            silent = stats.silent,
            removed = stats.removed,
            "no-data sweep complete"
        );
        Ok(stats)
    }

    async fn sweep_item(
        &self,
        snapshot: &StrategySnapshot,
        item_ref: ItemRef<'_>,
        now: i64,
        stats: &mut NoDataStats,
    ) -> DetectResult<()> {
        let store = self.emitter.store();
        let key = item_ref.key();
        let config = &item_ref.item.no_data;
        let interval = item_ref.item.interval.max(1) as i64;
        let check_time = now - now.rem_euclid(interval);

        let cursor = store
            .get_checkpoint(key, LATEST_NO_DATA_CHECK_POINT, config.level)
            .await?;
        if cursor.is_some_and(|c| c >= check_time) {
            stats.skipped += 1;
            return Ok(());
        }

        let window = i64::from(config.continuous.max(1)) * interval;
        let ttl = store.ttl_secs() as i64;
        let latest = store.latest_by_dimension(key).await?;
        let dimensions: BTreeMap<_, _> = store.get_dimensions(key).await?.into_iter().collect();

        let mut stale = Vec::new();
        for (dmd5, dims) in dimensions {
            stats.dimensions += 1;
            let last = match latest.get(&dmd5) {
                Some(last) if now - last <= ttl => *last,
                _ => {
                    stale.push(dmd5);
                    continue;
                }
            };
            let silent = check_time - last;
            if silent < window {
                continue;
            }
            let rid = record_id(&dmd5, check_time);
            let emission = Emission {
                item: key,
                point: PointData {
                    record_id: rid.clone(),
                    value: None,
                    values: BTreeMap::new(),
                    dimensions: dims,
                    time: check_time,
                },
                anomalies: vec![Anomaly {
                    level: config.level,
                    anomaly_id: anomaly_id(&rid, key.strategy_id, key.item_id, config.level),
                    anomaly_time: format_anomaly_time(check_time),
                    anomaly_message: format!("no data for {} periods", silent / interval),
                    tags: BTreeMap::new(),
                }],
                dimensions_md5: dmd5,
                snapshot_key: snapshot.snapshot_key(key.strategy_id),
            };
            self.emitter.emit_no_data(&emission).await?;
            stats.silent += 1;
        }

        stats.removed += store.remove_dimensions(key, &stale).await? as usize;
        store
            .update_checkpoint(key, LATEST_NO_DATA_CHECK_POINT, check_time, config.level)
            .await?;
        Ok(())
    }

    /// Sweep on a fixed cadence until shutdown. Returns the fatal error
    /// when the backend is gone.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> DetectResult<()> {
        info!(interval_secs = interval.as_secs(), "no-data sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "no-data sweeper stopping");
                        return Err(e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("no-data sweeper shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alarm_core::config::CheckResultSettings;
    use alarm_core::{AnomalyMessage, ItemKey, Level, ManualClock, Strategy};
    use alarm_kv::{MemoryKv, SingleNode};
    use alarm_strategy::StaticStrategySource;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::check_result::CheckResultStore;
    use crate::emitter::ChannelSink;

    struct Harness {
        clock: Arc<ManualClock>,
        emitter: Arc<AnomalyEmitter>,
        sweeper: NoDataSweeper,
        rx: mpsc::Receiver<AnomalyMessage>,
    }

    fn strategies() -> Vec<Strategy> {
        serde_json::from_value(json!([
            { "id": 1, "bk_biz_id": 2, "items": [{
                "id": 11, "interval": 60, "data_type_labels": ["time_series"],
                "no_data": { "enabled": true, "continuous": 3, "level": 3 }
            }]},
            { "id": 2, "bk_biz_id": 2, "items": [{ "id": 21, "interval": 60 }]},
        ]))
        .unwrap()
    }

    async fn harness(now: f64) -> Harness {
        let clock = Arc::new(ManualClock::new(now));
        let kv = Arc::new(MemoryKv::with_clock(clock.clone()));
        let store = Arc::new(CheckResultStore::new(
            Arc::new(SingleNode(kv)),
            &CheckResultSettings {
                max_points: 30,
                ttl_secs: 3600,
            },
        ));
        let metrics = Arc::new(PipelineMetrics::new());
        let (tx, rx) = mpsc::channel(16);
        let emitter = Arc::new(AnomalyEmitter::new(
            store,
            Arc::new(ChannelSink::new(tx)),
            metrics.clone(),
        ));
        let cache = Arc::new(StrategyCache::new(Arc::new(StaticStrategySource::new(
            strategies(),
        ))));
        cache.refresh().await.unwrap();
        let sweeper = NoDataSweeper::new(cache, emitter.clone(), clock.clone(), metrics);
        Harness {
            clock,
            emitter,
            sweeper,
            rx,
        }
    }

    async fn seen(h: &Harness, dmd5: &str, ip: &str, time: i64) {
        let dims = BTreeMap::from([("ip".to_string(), ip.to_string())]);
        h.emitter
            .observe(ItemKey::new(1, 11), dmd5, &dims, time, Level::Warning)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn silent_dimension_raises_no_data() {
        let mut h = harness(900.0).await;
        seen(&h, "d", "a", 600).await;
        seen(&h, "e", "b", 780).await;

        let stats = h.sweeper.sweep().await.unwrap();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.dimensions, 2);
        assert_eq!(stats.silent, 1);

        let message = h.rx.recv().await.unwrap();
        assert_eq!(message.trigger.level, Level::Reminder);
        assert_eq!(message.data.time, 900);
        assert_eq!(message.data.dimensions["ip"], "a");
        assert_eq!(message.anomaly["3"].anomaly_message, "no data for 5 periods");
    }

    #[tokio::test]
    async fn one_sweep_per_period() {
        let mut h = harness(900.0).await;
        seen(&h, "d", "a", 600).await;
        h.sweeper.sweep().await.unwrap();
        h.rx.recv().await.unwrap();

        h.clock.advance(30.0);
        let stats = h.sweeper.sweep().await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert!(h.rx.try_recv().is_err());

        h.clock.advance(30.0);
        let stats = h.sweeper.sweep().await.unwrap();
        assert_eq!(stats.silent, 1);
        assert_eq!(h.rx.recv().await.unwrap().data.time, 960);
    }

    #[tokio::test]
    async fn long_silent_dimensions_are_forgotten() {
        let h = harness(900.0).await;
        seen(&h, "d", "a", 600).await;
        h.clock.set(5000.0);
        let stats = h.sweeper.sweep().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.silent, 0);
        let remaining = h.emitter.store().get_dimensions(ItemKey::new(1, 11)).await.unwrap();
        assert!(remaining.is_empty());
    }
}
