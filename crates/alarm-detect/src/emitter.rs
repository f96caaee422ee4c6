//! Persisting evaluations and publishing anomalies.
//!
//! ```text
//! anomaly ─► CHECK_RESULT  "ts|ANOMALY"                         (per level)
//!         ─► LAST_CHECKPOINTS  dmd5|lvl  and  __latest_point_with_all__|lvl
//!         ─► MD5_TO_DIM
//!         ─► AnomalySink  (alert-event, one message per point)
//! normal  ─► CHECK_RESULT  "ts|value", checkpoints, MD5_TO_DIM
//! ```
//!
//! Sinks are at-least-once: publishing the same anomaly twice yields the
//! same check-result state, and consumers dedupe on `anomaly_id`.

use std::collections::BTreeMap;
use std::sync::Arc;

use alarm_core::{Anomaly, AnomalyMessage, ItemKey, Level, PointData};
use alarm_kv::keys::CheckResultKey;
use alarm_kv::SharedKv;
use alarm_metrics::PipelineMetrics;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::check_result::{CheckResultStore, ANOMALY_LABEL};
use crate::error::{DetectError, DetectResult};

#[async_trait]
pub trait AnomalySink: Send + Sync {
    async fn publish(&self, message: &AnomalyMessage) -> DetectResult<()>;

    fn name(&self) -> &'static str;
}

/// Publishes JSON on a KV pub/sub channel.
pub struct KvPublishSink {
    kv: SharedKv,
    channel: String,
}

impl KvPublishSink {
    pub fn new(kv: SharedKv, channel: impl Into<String>) -> Self {
        Self {
            kv,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl AnomalySink for KvPublishSink {
    async fn publish(&self, message: &AnomalyMessage) -> DetectResult<()> {
        let payload = serde_json::to_string(message)?;
        let receivers = self.kv.publish(&self.channel, &payload).await?;
        debug!(channel = %self.channel, receivers, "anomaly published");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "kv_publish"
    }
}

/// Hands messages to an in-process consumer.
pub struct ChannelSink {
    tx: mpsc::Sender<AnomalyMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<AnomalyMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl AnomalySink for ChannelSink {
    async fn publish(&self, message: &AnomalyMessage) -> DetectResult<()> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| DetectError::Sink("anomaly channel closed".to_string()))
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Publishes to every inner sink in order; the first failure wins.
pub struct FanoutSink(pub Vec<Arc<dyn AnomalySink>>);

#[async_trait]
impl AnomalySink for FanoutSink {
    async fn publish(&self, message: &AnomalyMessage) -> DetectResult<()> {
        for sink in &self.0 {
            sink.publish(message).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}

/// The anomalies one point raised on one item, ready to leave the stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub item: ItemKey,
    pub dimensions_md5: String,
    pub point: PointData,
    pub anomalies: Vec<Anomaly>,
    pub snapshot_key: String,
}

impl Emission {
    fn check_result_key(&self, level: Level) -> CheckResultKey {
        CheckResultKey::new(
            self.item.strategy_id,
            self.item.item_id,
            &self.dimensions_md5,
            level,
        )
    }
}

pub struct AnomalyEmitter {
    store: Arc<CheckResultStore>,
    sink: Arc<dyn AnomalySink>,
    metrics: Arc<PipelineMetrics>,
}

impl AnomalyEmitter {
    pub fn new(
        store: Arc<CheckResultStore>,
        sink: Arc<dyn AnomalySink>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            sink,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<CheckResultStore> {
        &self.store
    }

    /// Record every level's anomaly, then publish the point once.
    pub async fn emit(&self, emission: &Emission) -> DetectResult<()> {
        let time = emission.point.time;
        for anomaly in &emission.anomalies {
            self.store
                .record(&emission.check_result_key(anomaly.level), time, ANOMALY_LABEL)
                .await?;
            self.observe(
                emission.item,
                &emission.dimensions_md5,
                &emission.point.dimensions,
                time,
                anomaly.level,
            )
            .await?;
        }
        self.publish(emission).await
    }

    /// A no-data anomaly: recorded and published, but the series'
    /// checkpoints stay where the last real point left them.
    pub async fn emit_no_data(&self, emission: &Emission) -> DetectResult<()> {
        for anomaly in &emission.anomalies {
            self.store
                .record(
                    &emission.check_result_key(anomaly.level),
                    emission.point.time,
                    ANOMALY_LABEL,
                )
                .await?;
        }
        self.publish(emission).await
    }

    /// A non-anomalous evaluation of `value` at `level`.
    pub async fn record_normal(
        &self,
        item: ItemKey,
        dimensions_md5: &str,
        dimensions: &BTreeMap<String, String>,
        time: i64,
        level: Level,
        value: f64,
    ) -> DetectResult<()> {
        let key = CheckResultKey::new(item.strategy_id, item.item_id, dimensions_md5, level);
        self.store.record(&key, time, &value.to_string()).await?;
        self.observe(item, dimensions_md5, dimensions, time, level).await
    }

    /// Note that the series produced a point at `time`.
    pub async fn observe(
        &self,
        item: ItemKey,
        dimensions_md5: &str,
        dimensions: &BTreeMap<String, String>,
        time: i64,
        level: Level,
    ) -> DetectResult<()> {
        self.store
            .update_checkpoint(item, dimensions_md5, time, level)
            .await?;
        self.store.advance_latest(item, time, level).await?;
        self.store
            .save_dimensions(item, &[(dimensions_md5.to_string(), dimensions.clone())])
            .await?;
        Ok(())
    }

    async fn publish(&self, emission: &Emission) -> DetectResult<()> {
        if emission.anomalies.is_empty() {
            return Ok(());
        }
        let message = AnomalyMessage::new(
            emission.point.clone(),
            &emission.anomalies,
            emission.item,
            emission.snapshot_key.clone(),
        );
        self.sink.publish(&message).await?;
        for anomaly in &emission.anomalies {
            self.metrics.anomaly_emitted(anomaly.level.as_u8());
        }
        debug!(
            record_id = %emission.point.record_id,
            trigger_level = message.trigger.level.as_u8(),
            levels = emission.anomalies.len(),
            sink = self.sink.name(),
            "anomaly emitted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alarm_core::config::CheckResultSettings;
    use alarm_core::hashing::{anomaly_id, format_anomaly_time, record_id};
    use alarm_kv::keys::{self, LATEST_POINT_WITH_ALL_KEY};
    use alarm_kv::{KvClient, MemoryKv, SingleNode};

    use super::*;

    struct Harness {
        kv: Arc<MemoryKv>,
        emitter: AnomalyEmitter,
        rx: mpsc::Receiver<AnomalyMessage>,
        metrics: Arc<PipelineMetrics>,
    }

    fn harness(max_points: usize) -> Harness {
        let kv = Arc::new(MemoryKv::new());
        let store = Arc::new(CheckResultStore::new(
            Arc::new(SingleNode(kv.clone())),
            &CheckResultSettings {
                max_points,
                ttl_secs: 3600,
            },
        ));
        let (tx, rx) = mpsc::channel(64);
        let metrics = Arc::new(PipelineMetrics::new());
        let emitter = AnomalyEmitter::new(store, Arc::new(ChannelSink::new(tx)), metrics.clone());
        Harness {
            kv,
            emitter,
            rx,
            metrics,
        }
    }

    fn anomaly(rid: &str, level: Level, time: i64) -> Anomaly {
        Anomaly {
            level,
            anomaly_id: anomaly_id(rid, 1, 11, level),
            anomaly_time: format_anomaly_time(time),
            anomaly_message: "current value 12 >= 10".to_string(),
            tags: BTreeMap::new(),
        }
    }

    fn emission(time: i64) -> Emission {
        let rid = record_id("d", time);
        Emission {
            item: ItemKey::new(1, 11),
            dimensions_md5: "d".to_string(),
            point: PointData {
                record_id: rid.clone(),
                value: Some(12.0),
                values: BTreeMap::new(),
                dimensions: BTreeMap::from([("ip".to_string(), "10.0.0.1".to_string())]),
                time,
            },
            anomalies: vec![anomaly(&rid, Level::Warning, time)],
            snapshot_key: "bkmonitor.STRATEGY_SNAPSHOT.1.1".to_string(),
        }
    }

    #[tokio::test]
    async fn emit_persists_and_publishes() {
        let mut h = harness(30);
        h.emitter.emit(&emission(1000)).await.unwrap();

        let key = keys::check_result(1, 11, "d", Level::Warning);
        let members = h.kv.zrange_withscores(&key, 0, -1).await.unwrap();
        assert_eq!(members, vec![("1000|ANOMALY".to_string(), 1000.0)]);

        let store = h.emitter.store();
        let item = ItemKey::new(1, 11);
        assert_eq!(store.get_checkpoint(item, "d", Level::Warning).await.unwrap(), Some(1000));
        assert_eq!(
            store
                .get_checkpoint(item, LATEST_POINT_WITH_ALL_KEY, Level::Warning)
                .await
                .unwrap(),
            Some(1000)
        );
        assert!(store.get_dimensions(item).await.unwrap().contains_key("d"));

        let message = h.rx.recv().await.unwrap();
        assert_eq!(message.trigger.anomaly_ids, vec!["d.1000.1.11.2".to_string()]);
        assert_eq!(h.metrics.anomalies_emitted(2), 1);
    }

    #[tokio::test]
    async fn levels_of_one_point_share_a_message() {
        let mut h = harness(30);
        let mut e = emission(1000);
        let rid = e.point.record_id.clone();
        e.anomalies.push(anomaly(&rid, Level::Fatal, 1000));
        h.emitter.emit(&e).await.unwrap();

        for level in [Level::Fatal, Level::Warning] {
            let key = keys::check_result(1, 11, "d", level);
            assert_eq!(h.kv.zcard(&key).await.unwrap(), 1);
            assert_eq!(
                h.emitter
                    .store()
                    .get_checkpoint(ItemKey::new(1, 11), "d", level)
                    .await
                    .unwrap(),
                Some(1000)
            );
        }

        let message = h.rx.recv().await.unwrap();
        assert_eq!(message.trigger.level, Level::Fatal);
        assert_eq!(
            message.trigger.anomaly_ids,
            vec!["d.1000.1.11.1".to_string(), "d.1000.1.11.2".to_string()]
        );
        assert_eq!(message.anomaly.len(), 2);
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.metrics.anomalies_emitted(1), 1);
        assert_eq!(h.metrics.anomalies_emitted(2), 1);
    }

    #[tokio::test]
    async fn emit_twice_is_idempotent_in_store() {
        let h = harness(30);
        h.emitter.emit(&emission(1000)).await.unwrap();
        h.emitter.emit(&emission(1000)).await.unwrap();
        let key = keys::check_result(1, 11, "d", Level::Warning);
        assert_eq!(h.kv.zcard(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn emissions_are_trimmed() {
        let h = harness(3);
        for ts in 1..=5 {
            h.emitter.emit(&emission(ts)).await.unwrap();
        }
        let key = keys::check_result(1, 11, "d", Level::Warning);
        let members: Vec<String> = h
            .kv
            .zrange_withscores(&key, 0, -1)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["3|ANOMALY", "4|ANOMALY", "5|ANOMALY"]);
    }

    #[tokio::test]
    async fn normal_points_store_their_value() {
        let h = harness(30);
        let dims = BTreeMap::new();
        h.emitter
            .record_normal(ItemKey::new(1, 11), "d", &dims, 60, Level::Fatal, 3.5)
            .await
            .unwrap();
        let key = keys::check_result(1, 11, "d", Level::Fatal);
        let members = h.kv.zrange_withscores(&key, 0, -1).await.unwrap();
        assert_eq!(members, vec![("60|3.5".to_string(), 60.0)]);
    }

    #[tokio::test]
    async fn no_data_leaves_checkpoints_alone() {
        let mut h = harness(30);
        h.emitter.emit_no_data(&emission(1000)).await.unwrap();
        let item = ItemKey::new(1, 11);
        assert_eq!(
            h.emitter
                .store()
                .get_checkpoint(item, "d", Level::Warning)
                .await
                .unwrap(),
            None
        );
        assert!(h.rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_channel_is_a_sink_error() {
        let Harness { emitter, rx, .. } = harness(30);
        drop(rx);
        let err = emitter.emit(&emission(1000)).await.unwrap_err();
        assert!(matches!(err, DetectError::Sink(_)));
    }
}
