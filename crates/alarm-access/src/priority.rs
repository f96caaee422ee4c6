//! Priority dedup across strategies sharing a `priority_group_key`.
//!
//! Each group keeps a hash `dimensions_md5 → "<priority>:<ts>"` in KV
//! naming the strongest strategy recently seen on that series. A point
//! is inhibited when the incumbent is strictly higher and still fresh
//! (seen within 5 intervals). Entries older than 10 intervals are swept
//! after every batch.
//!
//! ```text
//! batch start: HGETALL per group ─► local snapshot
//! per record:  items by priority desc ─► decide ─► queue updates
//! batch end:   HMSET updates + HDEL stale + EXPIRE   (one pipeline)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use alarm_core::{AccessRecord, ItemKey, SharedClock};
use alarm_kv::{keys, KvOp, SharedKv};
use alarm_metrics::PipelineMetrics;
use alarm_strategy::StrategySnapshot;
use tracing::{debug, warn};

const FRESH_INTERVALS: f64 = 5.0;
const SWEEP_INTERVALS: f64 = 10.0;

/// One `"<priority>:<ts>"` value of a group hash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityEntry {
    pub priority: i64,
    pub timestamp: f64,
}

impl FromStr for PriorityEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (priority, timestamp) = s
            .split_once(':')
            .ok_or_else(|| format!("bad priority entry {s:?}"))?;
        Ok(Self {
            priority: priority
                .parse()
                .map_err(|_| format!("bad priority in {s:?}"))?,
            timestamp: timestamp
                .parse()
                .map_err(|_| format!("bad timestamp in {s:?}"))?,
        })
    }
}

impl fmt::Display for PriorityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.priority, self.timestamp)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PriorityStats {
    pub inhibited: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Default)]
struct GroupState {
    entries: HashMap<String, PriorityEntry>,
    updates: HashMap<String, PriorityEntry>,
    max_interval: u64,
    readable: bool,
}

pub struct PriorityChecker {
    kv: SharedKv,
    clock: SharedClock,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl PriorityChecker {
    pub fn new(kv: SharedKv, clock: SharedClock) -> Self {
        Self {
            kv,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn count_kv_error(&self, kind: &str) {
        if let Some(m) = &self.metrics {
            m.kv_error("priority", kind);
        }
    }

    /// Mark inhibited items on `records`. Only retained items of
    /// strategies in a priority group take part.
    pub async fn check_records<R: AccessRecord>(
        &self,
        snapshot: &StrategySnapshot,
        records: &mut [R],
    ) -> PriorityStats {
        let mut groups: HashMap<String, GroupState> = HashMap::new();
        for record in records.iter() {
            for key in &record.matches().items {
                if let Some(r) = snapshot.item(*key) {
                    if r.strategy.in_priority_group() {
                        let state = groups.entry(r.strategy.priority_group_key.clone()).or_default();
                        state.max_interval = state.max_interval.max(r.item.interval);
                    }
                }
            }
        }
        if groups.is_empty() {
            return PriorityStats::default();
        }

        for (group, state) in groups.iter_mut() {
            match self.kv.hgetall(&keys::access_priority(group)).await {
                Ok(raw) => {
                    state.readable = true;
                    for (dmd5, value) in raw {
                        match value.parse::<PriorityEntry>() {
                            Ok(entry) => {
                                state.entries.insert(dmd5, entry);
                            }
                            Err(e) => debug!(%group, error = %e, "unparsable priority entry ignored"),
                        }
                    }
                }
                Err(e) => {
                    warn!(%group, error = %e, "priority group load failed, deciding on empty state");
                    self.count_kv_error(e.kind());
                }
            }
        }

        let now = self.clock.now();
        let mut stats = PriorityStats::default();
        for record in records.iter_mut() {
            let dmd5 = record.dimensions_md5().to_string();
            let mut ordered: Vec<(ItemKey, i64, String, u64)> = record
                .matches()
                .items
                .iter()
                .filter(|k| record.matches().is_retains.get(&k.item_id).copied().unwrap_or(false))
                .filter_map(|k| snapshot.item(*k))
                .filter(|r| r.strategy.in_priority_group())
                .map(|r| {
                    (
                        r.key(),
                        r.strategy.priority,
                        r.strategy.priority_group_key.clone(),
                        r.item.interval,
                    )
                })
                .collect();
            ordered.sort_by(|a, b| b.1.cmp(&a.1));

            for (key, priority, group, interval) in ordered {
                let Some(state) = groups.get_mut(&group) else {
                    continue;
                };
                let inhibited = match state.entries.get(&dmd5) {
                    Some(incumbent) => {
                        let stale = now - incumbent.timestamp > FRESH_INTERVALS * interval as f64;
                        !stale && incumbent.priority > priority
                    }
                    None => false,
                };
                if inhibited {
                    stats.inhibited += 1;
                } else if priority > 0 {
                    let entry = PriorityEntry {
                        priority,
                        timestamp: now,
                    };
                    state.entries.insert(dmd5.clone(), entry);
                    state.updates.insert(dmd5.clone(), entry);
                }
                record.matches_mut().set_inhibited(key.item_id, inhibited);
            }
        }

        for (group, state) in groups {
            if !state.readable {
                continue;
            }
            let sweep_after = SWEEP_INTERVALS * state.max_interval as f64;
            let stale: Vec<String> = state
                .entries
                .iter()
                .filter(|(dmd5, e)| !state.updates.contains_key(*dmd5) && now - e.timestamp > sweep_after)
                .map(|(dmd5, _)| dmd5.clone())
                .collect();
            let updated = state.updates.len();
            let removed = stale.len();
            if updated == 0 && removed == 0 {
                continue;
            }

            let key = keys::access_priority(&group);
            let ttl = keys::ACCESS_PRIORITY_TTL_SECS.max(SWEEP_INTERVALS as u64 * state.max_interval);
            let mut ops = Vec::with_capacity(3);
            if updated > 0 {
                ops.push(KvOp::HMSet {
                    key: key.clone(),
                    pairs: state
                        .updates
                        .iter()
                        .map(|(dmd5, e)| (dmd5.clone(), e.to_string()))
                        .collect(),
                });
            }
            if removed > 0 {
                ops.push(KvOp::HDel {
                    key: key.clone(),
                    fields: stale,
                });
            }
            ops.push(KvOp::Expire {
                key,
                ttl_secs: ttl,
            });
            match self.kv.pipeline(ops).await {
                Ok(_) => {
                    stats.updated += updated;
                    stats.removed += removed;
                }
                Err(e) => {
                    warn!(%group, error = %e, "priority write-back failed, decisions kept");
                    self.count_kv_error(e.kind());
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use alarm_core::{DataRecord, ItemMatches, ManualClock, Strategy};
    use alarm_kv::{KvClient, MemoryKv};
    use serde_json::json;

    use super::*;

    fn make_strategy(id: u64, priority: i64, group: &str) -> Strategy {
        serde_json::from_value(json!({
            "id": id,
            "bk_biz_id": 2,
            "priority": priority,
            "priority_group_key": group,
            "items": [{ "id": id * 10, "interval": 60, "query_md5": "q" }],
        }))
        .unwrap()
    }

    fn make_record(dmd5: &str, time: i64, items: &[(u64, u64)]) -> DataRecord {
        let mut record = DataRecord::new(BTreeMap::new(), Some(1.0), BTreeMap::new(), time);
        record.dimensions_md5 = dmd5.to_string();
        record.matches = ItemMatches::new(items.iter().map(|(s, i)| ItemKey::new(*s, *i)).collect());
        record
    }

    fn test_checker(now: f64) -> (MemoryKv, PriorityChecker) {
        let clock = Arc::new(ManualClock::new(now));
        let kv = MemoryKv::with_clock(clock.clone());
        let checker = PriorityChecker::new(Arc::new(kv.clone()), clock);
        (kv, checker)
    }

    fn snapshot(strategies: Vec<Strategy>) -> StrategySnapshot {
        StrategySnapshot::build(strategies, 1, 0).0
    }

    #[tokio::test]
    async fn higher_priority_inhibits_lower_in_same_batch() {
        let (kv, checker) = test_checker(1000.0);
        let snap = snapshot(vec![make_strategy(1, 10, "g1"), make_strategy(2, 5, "g1")]);
        let mut records = vec![make_record("d", 1000, &[(2, 20), (1, 10)])];

        let stats = checker.check_records(&snap, &mut records).await;
        assert_eq!(stats.inhibited, 1);
        assert!(!records[0].matches.is_inhibited(10));
        assert!(records[0].matches.is_inhibited(20));
        assert_eq!(
            kv.hget("bkmonitor.ACCESS_PRIORITY.g1", "d").await.unwrap().as_deref(),
            Some("10:1000")
        );
    }

    #[tokio::test]
    async fn stale_incumbent_does_not_inhibit() {
        let (kv, checker) = test_checker(1500.0);
        kv.hset("bkmonitor.ACCESS_PRIORITY.g1", "d", "10:900").await.unwrap();
        let snap = snapshot(vec![make_strategy(1, 10, "g1"), make_strategy(2, 5, "g1")]);
        let mut records = vec![make_record("d", 1500, &[(2, 20)])];

        checker.check_records(&snap, &mut records).await;
        assert!(!records[0].matches.is_inhibited(20));
        assert_eq!(
            kv.hget("bkmonitor.ACCESS_PRIORITY.g1", "d").await.unwrap().as_deref(),
            Some("5:1500")
        );
    }

    #[tokio::test]
    async fn fresh_incumbent_inhibits_across_batches() {
        let (kv, checker) = test_checker(1100.0);
        kv.hset("bkmonitor.ACCESS_PRIORITY.g1", "d", "10:1000").await.unwrap();
        let snap = snapshot(vec![make_strategy(1, 10, "g1"), make_strategy(2, 5, "g1")]);
        let mut records = vec![make_record("d", 1100, &[(2, 20)])];

        checker.check_records(&snap, &mut records).await;
        assert!(records[0].matches.is_inhibited(20));
        assert_eq!(
            kv.hget("bkmonitor.ACCESS_PRIORITY.g1", "d").await.unwrap().as_deref(),
            Some("10:1000")
        );
    }

    #[tokio::test]
    async fn equal_priority_is_not_inhibited() {
        let (_, checker) = test_checker(1000.0);
        let snap = snapshot(vec![make_strategy(1, 5, "g1"), make_strategy(2, 5, "g1")]);
        let mut records = vec![make_record("d", 1000, &[(1, 10), (2, 20)])];
        let stats = checker.check_records(&snap, &mut records).await;
        assert_eq!(stats.inhibited, 0);
    }

    #[tokio::test]
    async fn priority_zero_is_never_stored() {
        let (kv, checker) = test_checker(1000.0);
        let snap = snapshot(vec![make_strategy(1, 0, "g1")]);
        let mut records = vec![make_record("d", 1000, &[(1, 10)])];
        checker.check_records(&snap, &mut records).await;
        assert!(!records[0].matches.is_inhibited(10));
        assert!(kv.hgetall("bkmonitor.ACCESS_PRIORITY.g1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn very_old_entries_are_swept() {
        let (kv, checker) = test_checker(2000.0);
        kv.hset("bkmonitor.ACCESS_PRIORITY.g1", "old", "3:1000").await.unwrap();
        kv.hset("bkmonitor.ACCESS_PRIORITY.g1", "recent", "3:1700").await.unwrap();
        let snap = snapshot(vec![make_strategy(1, 5, "g1")]);
        let mut records = vec![make_record("d", 2000, &[(1, 10)])];

        let stats = checker.check_records(&snap, &mut records).await;
        assert_eq!(stats.removed, 1);
        let hash = kv.hgetall("bkmonitor.ACCESS_PRIORITY.g1").await.unwrap();
        assert!(!hash.contains_key("old"));
        assert!(hash.contains_key("recent"));
        assert!(hash.contains_key("d"));
    }

    #[tokio::test]
    async fn strategies_without_group_are_untouched() {
        let (kv, checker) = test_checker(1000.0);
        let snap = snapshot(vec![make_strategy(1, 10, "")]);
        let mut records = vec![make_record("d", 1000, &[(1, 10)])];
        let stats = checker.check_records(&snap, &mut records).await;
        assert_eq!(stats, PriorityStats::default());
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn write_failure_keeps_decisions() {
        let (kv, checker) = test_checker(1000.0);
        let snap = snapshot(vec![make_strategy(1, 10, "g1"), make_strategy(2, 5, "g1")]);
        let mut records = vec![make_record("d", 1000, &[(1, 10), (2, 20)])];
        kv.set_down(true);
        let stats = checker.check_records(&snap, &mut records).await;
        assert!(records[0].matches.is_inhibited(20));
        assert_eq!(stats.updated, 0);
    }

    #[test]
    fn entry_round_trip_text() {
        let entry: PriorityEntry = "10:1000.5".parse().unwrap();
        assert_eq!(entry.priority, 10);
        assert_eq!(entry.to_string(), "10:1000.5");
        assert!("nonsense".parse::<PriorityEntry>().is_err());
    }
}
