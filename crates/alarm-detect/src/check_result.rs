//! Per-dimension detection evidence.
//!
//! ```text
//! bkmonitor.CHECK_RESULT.{sid}.{iid}.{dmd5}.{lvl}   zset  "ts|ANOMALY" / "ts|value" by ts
//! bkmonitor.LAST_CHECKPOINTS.{sid}.{iid}            hash  "dmd5|lvl" -> ts
//! bkmonitor.MD5_TO_DIM.detect.{sid}.{iid}           hash  dmd5 -> dimensions json
//! ```
//!
//! Every key of a strategy lives on the node the cache router assigns to
//! it. The sorted set is bounded twice: by rank (`max_points`) and by
//! score (older than `ttl_secs` behind the newest write).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alarm_core::config::CheckResultSettings;
use alarm_core::{ItemKey, Level};
use alarm_kv::keys::{self, CheckResultKey, LATEST_NO_DATA_CHECK_POINT, LATEST_POINT_WITH_ALL_KEY};
use alarm_kv::{KvError, KvOp, KvResult, KvRoute, SharedKv};
use tracing::{debug, info, warn};

/// Service segment of the dimension-map keys written by this stage.
pub const SERVICE: &str = "detect";

/// Member label of an anomalous evaluation.
pub const ANOMALY_LABEL: &str = "ANOMALY";

pub fn member(time: i64, label: &str) -> String {
    format!("{time}|{label}")
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrimStats {
    pub keys: usize,
    pub removed: u64,
}

pub struct CheckResultStore {
    route: Arc<dyn KvRoute>,
    max_points: usize,
    ttl_secs: u64,
}

impl CheckResultStore {
    pub fn new(route: Arc<dyn KvRoute>, settings: &CheckResultSettings) -> Self {
        Self {
            route,
            max_points: settings.max_points,
            ttl_secs: settings.ttl_secs,
        }
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    fn client(&self, strategy_id: u64) -> SharedKv {
        self.route.client_for(strategy_id)
    }

    // ── Sorted set ─────────────────────────────────────────────────

    /// Add members; the key gets its TTL when this call created it.
    pub async fn add(&self, key: &CheckResultKey, members: &[(String, f64)]) -> KvResult<u64> {
        let kv = self.client(key.strategy_id);
        let name = key.key();
        let inserted = kv.zadd(&name, members).await?;
        if inserted > 0 && kv.ttl(&name).await?.is_none() {
            kv.expire(&name, self.ttl_secs).await?;
        }
        Ok(inserted)
    }

    /// Drop the oldest members so at most `keep_last` remain.
    pub async fn trim_by_rank(&self, key: &CheckResultKey, keep_last: usize) -> KvResult<u64> {
        self.client(key.strategy_id)
            .zremrangebyrank(&key.key(), 0, -(keep_last as i64) - 1)
            .await
    }

    /// Drop members scored at or before `expire_ts`.
    pub async fn trim_by_score(&self, key: &CheckResultKey, expire_ts: i64) -> KvResult<u64> {
        self.client(key.strategy_id)
            .zremrangebyscore(&key.key(), f64::NEG_INFINITY, expire_ts as f64)
            .await
    }

    /// Add one member and apply both bounds in a single pipeline.
    pub async fn record(&self, key: &CheckResultKey, time: i64, label: &str) -> KvResult<()> {
        let name = key.key();
        self.client(key.strategy_id)
            .pipeline(vec![
                KvOp::ZAdd {
                    key: name.clone(),
                    members: vec![(member(time, label), time as f64)],
                },
                KvOp::ZRemRangeByRank {
                    key: name.clone(),
                    start: 0,
                    stop: -(self.max_points as i64) - 1,
                },
                KvOp::ZRemRangeByScore {
                    key: name.clone(),
                    min: f64::NEG_INFINITY,
                    max: (time - self.ttl_secs as i64) as f64,
                },
                KvOp::Expire {
                    key: name,
                    ttl_secs: self.ttl_secs,
                },
            ])
            .await?;
        Ok(())
    }

    /// Members oldest first.
    pub async fn members(&self, key: &CheckResultKey) -> KvResult<Vec<(String, f64)>> {
        self.client(key.strategy_id)
            .zrange_withscores(&key.key(), 0, -1)
            .await
    }

    // ── Checkpoints ────────────────────────────────────────────────

    pub async fn update_checkpoint(
        &self,
        item: ItemKey,
        dimensions_md5: &str,
        time: i64,
        level: Level,
    ) -> KvResult<()> {
        let key = keys::last_checkpoints(item.strategy_id, item.item_id);
        self.client(item.strategy_id)
            .pipeline(vec![
                KvOp::HSet {
                    key: key.clone(),
                    field: keys::checkpoint_field(dimensions_md5, level),
                    value: time.to_string(),
                },
                KvOp::Expire {
                    key,
                    ttl_secs: self.ttl_secs,
                },
            ])
            .await?;
        Ok(())
    }

    /// Move the item-wide cursor forward; an older `time` is ignored.
    pub async fn advance_latest(&self, item: ItemKey, time: i64, level: Level) -> KvResult<bool> {
        let current = self
            .get_checkpoint(item, LATEST_POINT_WITH_ALL_KEY, level)
            .await?;
        if current.is_some_and(|c| c >= time) {
            return Ok(false);
        }
        self.update_checkpoint(item, LATEST_POINT_WITH_ALL_KEY, time, level)
            .await?;
        Ok(true)
    }

    pub async fn get_checkpoint(
        &self,
        item: ItemKey,
        dimensions_md5: &str,
        level: Level,
    ) -> KvResult<Option<i64>> {
        let raw = self
            .client(item.strategy_id)
            .hget(
                &keys::last_checkpoints(item.strategy_id, item.item_id),
                &keys::checkpoint_field(dimensions_md5, level),
            )
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    /// Newest checkpoint per real dimension across every level.
    pub async fn latest_by_dimension(&self, item: ItemKey) -> KvResult<HashMap<String, i64>> {
        let raw = self
            .client(item.strategy_id)
            .hgetall(&keys::last_checkpoints(item.strategy_id, item.item_id))
            .await?;
        let mut latest: HashMap<String, i64> = HashMap::new();
        for (field, value) in raw {
            let Some((dmd5, _level)) = field.rsplit_once('|') else {
                continue;
            };
            if dmd5 == LATEST_POINT_WITH_ALL_KEY || dmd5 == LATEST_NO_DATA_CHECK_POINT {
                continue;
            }
            let Ok(ts) = value.parse::<i64>() else {
                continue;
            };
            let slot = latest.entry(dmd5.to_string()).or_insert(ts);
            *slot = (*slot).max(ts);
        }
        Ok(latest)
    }

    // ── Dimension map ──────────────────────────────────────────────

    pub async fn save_dimensions(
        &self,
        item: ItemKey,
        dimensions: &[(String, BTreeMap<String, String>)],
    ) -> KvResult<()> {
        if dimensions.is_empty() {
            return Ok(());
        }
        let key = keys::md5_to_dim(SERVICE, item.strategy_id, item.item_id);
        let mut pairs = Vec::with_capacity(dimensions.len());
        for (dmd5, dims) in dimensions {
            let json = serde_json::to_string(dims).map_err(|e| KvError::Serialize(e.to_string()))?;
            pairs.push((dmd5.clone(), json));
        }
        self.client(item.strategy_id)
            .pipeline(vec![
                KvOp::HMSet {
                    key: key.clone(),
                    pairs,
                },
                KvOp::Expire {
                    key,
                    ttl_secs: keys::MD5_TO_DIM_TTL_SECS,
                },
            ])
            .await?;
        Ok(())
    }

    pub async fn get_dimensions(
        &self,
        item: ItemKey,
    ) -> KvResult<HashMap<String, BTreeMap<String, String>>> {
        let raw = self
            .client(item.strategy_id)
            .hgetall(&keys::md5_to_dim(SERVICE, item.strategy_id, item.item_id))
            .await?;
        let mut out = HashMap::with_capacity(raw.len());
        for (dmd5, json) in raw {
            match serde_json::from_str(&json) {
                Ok(dims) => {
                    out.insert(dmd5, dims);
                }
                Err(e) => warn!(%dmd5, error = %e, "skipping malformed dimension entry"),
            }
        }
        Ok(out)
    }

    pub async fn remove_dimensions(&self, item: ItemKey, dimensions_md5: &[String]) -> KvResult<u64> {
        if dimensions_md5.is_empty() {
            return Ok(0);
        }
        self.client(item.strategy_id)
            .hdel(
                &keys::md5_to_dim(SERVICE, item.strategy_id, item.item_id),
                dimensions_md5,
            )
            .await
    }

    /// Items with a dimension map on any node.
    pub async fn list_dimension_keys(&self) -> KvResult<Vec<ItemKey>> {
        let mut items = Vec::new();
        for kv in self.route.all_clients() {
            for key in kv.scan_match(&keys::md5_to_dim_pattern(SERVICE)).await? {
                if let Some((sid, iid)) = keys::parse_md5_to_dim(SERVICE, &key) {
                    items.push(ItemKey::new(sid, iid));
                }
            }
        }
        items.sort();
        items.dedup();
        Ok(items)
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Apply both bounds to every check-result key, optionally of one
    /// strategy, on every node.
    pub async fn trim_all(&self, strategy_id: Option<u64>, now: i64) -> KvResult<TrimStats> {
        let expire_ts = now - self.ttl_secs as i64;
        let mut stats = TrimStats::default();
        for kv in self.route.all_clients() {
            for name in kv.scan_match(&keys::check_result_pattern(strategy_id)).await? {
                if keys::parse_check_result(&name).is_none() {
                    debug!(key = %name, "skipping foreign key");
                    continue;
                }
                stats.keys += 1;
                stats.removed += kv
                    .zremrangebyrank(&name, 0, -(self.max_points as i64) - 1)
                    .await?;
                stats.removed += kv
                    .zremrangebyscore(&name, f64::NEG_INFINITY, expire_ts as f64)
                    .await?;
            }
        }
        info!(
            keys = stats.keys,
            removed = stats.removed,
            strategy_id = ?strategy_id,
            "check results trimmed"
        );
        Ok(stats)
    }
}
