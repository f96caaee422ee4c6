//! Past values per series, read by the ring-ratio and year-round
//! detectors.
//!
//! ```text
//! bkmonitor.DETECT_HISTORY.{sid}.{iid}.{dmd5}   hash  ts -> value   (8 days)
//! ```

use std::collections::HashMap;

use alarm_core::ItemKey;
use alarm_kv::keys::{self, DETECT_HISTORY_TTL_SECS};
use alarm_kv::{KvOp, KvResult, SharedKv};

/// One value to remember.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub item: ItemKey,
    pub dimensions_md5: String,
    pub time: i64,
    pub value: f64,
}

#[derive(Clone)]
pub struct HistoryStore {
    kv: SharedKv,
}

impl HistoryStore {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    /// Values present at `times`. Missing or unparsable entries are absent.
    pub async fn fetch(
        &self,
        item: ItemKey,
        dimensions_md5: &str,
        times: &[i64],
    ) -> KvResult<HashMap<i64, f64>> {
        if times.is_empty() {
            return Ok(HashMap::new());
        }
        let key = keys::detect_history(item.strategy_id, item.item_id, dimensions_md5);
        let fields: Vec<String> = times.iter().map(i64::to_string).collect();
        let values = self.kv.hmget(&key, &fields).await?;
        Ok(times
            .iter()
            .zip(values)
            .filter_map(|(t, v)| Some((*t, v?.parse().ok()?)))
            .collect())
    }

    /// Store a batch of points in one pipeline.
    pub async fn record(&self, points: &[HistoryPoint]) -> KvResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(points.len() * 2);
        for point in points {
            let key = keys::detect_history(
                point.item.strategy_id,
                point.item.item_id,
                &point.dimensions_md5,
            );
            ops.push(KvOp::HSet {
                key: key.clone(),
                field: point.time.to_string(),
                value: point.value.to_string(),
            });
            ops.push(KvOp::Expire {
                key,
                ttl_secs: DETECT_HISTORY_TTL_SECS,
            });
        }
        self.kv.pipeline(ops).await?;
        Ok(())
    }
}
