//! Cross-batch duplicate detection.
//!
//! Remembers, per access group and timestamp, the record ids already let
//! through. The remembered set for a `(group, ts)` pair is loaded from
//! KV the first time it is needed and written back by [`flush`].
//!
//! [`flush`]: DuplicateFilter::flush

use std::collections::{HashMap, HashSet};

use alarm_kv::{keys, KvOp, KvResult, SharedKv};

pub struct DuplicateFilter {
    kv: SharedKv,
    ttl_secs: u64,
    seen: HashMap<(String, i64), HashSet<String>>,
    pending: HashMap<(String, i64), Vec<String>>,
}

impl DuplicateFilter {
    pub fn new(kv: SharedKv, ttl_secs: u64) -> Self {
        Self {
            kv,
            ttl_secs,
            seen: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub async fn is_duplicate(&mut self, group: &str, time: i64, record_id: &str) -> KvResult<bool> {
        let slot = (group.to_string(), time);
        if !self.seen.contains_key(&slot) {
            let known = self
                .kv
                .hgetall(&keys::access_duplicate(group, time))
                .await?
                .into_keys()
                .collect();
            self.seen.insert(slot.clone(), known);
        }
        Ok(self.seen.get(&slot).is_some_and(|ids| ids.contains(record_id)))
    }

    pub fn add(&mut self, group: &str, time: i64, record_id: &str) {
        let slot = (group.to_string(), time);
        if self.seen.entry(slot.clone()).or_default().insert(record_id.to_string()) {
            self.pending.entry(slot).or_default().push(record_id.to_string());
        }
    }

    /// Write every id added since the last flush.
    pub async fn flush(&mut self) -> KvResult<usize> {
        let mut ops = Vec::with_capacity(self.pending.len() * 2);
        let mut written = 0;
        for ((group, time), ids) in self.pending.drain() {
            let key = keys::access_duplicate(&group, time);
            written += ids.len();
            ops.push(KvOp::HMSet {
                key: key.clone(),
                pairs: ids.into_iter().map(|id| (id, "1".to_string())).collect(),
            });
            ops.push(KvOp::Expire {
                key,
                ttl_secs: self.ttl_secs,
            });
        }
        if !ops.is_empty() {
            self.kv.pipeline(ops).await?;
        }
        Ok(written)
    }
}
