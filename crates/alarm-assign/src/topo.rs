//! Host → CMDB node lookup.
//!
//! The CMDB sync job keeps one hash per business under
//! `bkmonitor.TOPO.biz_{id}`: `host key -> ["bk_obj_id|bk_inst_id", ...]`.
//! Host keys are `{ip}|{cloud_id}` or `service_instance|{id}`. Whole
//! business maps are cached locally for `max_age`.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alarm_core::Alert;
use alarm_kv::{keys, SharedKv};
use alarm_metrics::CacheStats;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::AssignResult;

type BizTopology = Arc<HashMap<String, Vec<String>>>;

/// Host key of the target an alert's dimensions describe.
pub fn host_key(dimensions: &BTreeMap<String, String>) -> Option<String> {
    let lookup = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| dimensions.get(*n))
            .filter(|v| !v.is_empty())
    };
    if let Some(id) = lookup(&["bk_target_service_instance_id", "service_instance_id"]) {
        return Some(format!("service_instance|{id}"));
    }
    let ip = lookup(&["bk_target_ip", "ip"])?;
    let cloud = lookup(&["bk_target_cloud_id", "bk_cloud_id"]).map_or("0", String::as_str);
    Some(format!("{ip}|{cloud}"))
}

pub struct TopologyCache {
    kv: SharedKv,
    max_age: Duration,
    local: Mutex<LruCache<i64, (Instant, BizTopology)>>,
    stats: Arc<CacheStats>,
}

impl TopologyCache {
    pub fn new(kv: SharedKv, capacity: NonZeroUsize, max_age: Duration) -> Self {
        Self {
            kv,
            max_age,
            local: Mutex::new(LruCache::new(capacity)),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    pub fn invalidate(&self) {
        let mut local = self.local.lock();
        local.clear();
        self.stats.set_size(0);
    }

    async fn business(&self, bk_biz_id: i64) -> AssignResult<BizTopology> {
        {
            let mut local = self.local.lock();
            if let Some((loaded, topo)) = local.get(&bk_biz_id) {
                if loaded.elapsed() < self.max_age {
                    self.stats.hit();
                    return Ok(topo.clone());
                }
            }
        }
        self.stats.miss();

        let raw = self.kv.hgetall(&keys::topology(bk_biz_id)).await?;
        let mut topo = HashMap::with_capacity(raw.len());
        for (host, json) in raw {
            match serde_json::from_str::<Vec<String>>(&json) {
                Ok(nodes) => {
                    topo.insert(host, nodes);
                }
                Err(e) => warn!(bk_biz_id, %host, error = %e, "skipping malformed topology entry"),
            }
        }
        let topo = Arc::new(topo);
        let mut local = self.local.lock();
        local.put(bk_biz_id, (Instant::now(), topo.clone()));
        self.stats.set_size(local.len());
        debug!(bk_biz_id, hosts = topo.len(), "topology loaded");
        Ok(topo)
    }

    /// CMDB nodes of the alert's target, or `None` when the target is
    /// unknown to the CMDB.
    pub async fn resolve(&self, alert: &Alert) -> AssignResult<Option<Vec<String>>> {
        let Some(host) = host_key(&alert.dimensions) else {
            return Ok(None);
        };
        let topo = self.business(alert.bk_biz_id).await?;
        Ok(topo.get(&host).cloned())
    }
}
