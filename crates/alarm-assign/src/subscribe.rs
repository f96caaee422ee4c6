//! Notice subscriptions, flattened per business and user.
//!
//! The config service writes one JSON row per subscription into the
//! `bkmonitor.NOTICE_SUBSCRIBE` hash. A refresh turns those rows into
//! the keys the router reads:
//!
//! ```text
//! NOTICE_SUBSCRIBE ──refresh──► SUBSCRIBE.biz_{biz}          ["alice","bob"]
//!                             └► SUBSCRIBE.user_{biz}_{user}  [rule, ...]  (-priority, id)
//! ```
//!
//! Only keys whose content changed are rewritten; unchanged keys get
//! their TTL extended and keys that disappeared are deleted, all in one
//! pipeline. Reads go through a small local LRU of compiled rules.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alarm_core::Alert;
use alarm_kv::keys::{self, NOTICE_SUBSCRIBE, SUBSCRIBE_TTL_SECS};
use alarm_kv::{KvOp, SharedKv};
use alarm_metrics::{CacheStats, PipelineMetrics};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::condition::{Condition, ConditionGroups, Method};
use crate::error::{AssignError, AssignResult};

/// Condition field that refers to dynamic groups by id.
pub const DYNAMIC_GROUP_FIELD: &str = "dynamic_group";

fn default_user_type() -> String {
    "main".to_string()
}

fn default_enabled() -> bool {
    true
}

/// One subscription rule as stored under a user key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRule {
    pub id: u64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_user_type")]
    pub user_type: String,
    #[serde(default)]
    pub user_group: Vec<String>,
    #[serde(default)]
    pub notice_ways: Vec<String>,
}

/// A row of the `NOTICE_SUBSCRIBE` hash.
#[derive(Debug, Clone, Deserialize)]
pub struct NoticeSubscribe {
    pub bk_biz_id: i64,
    pub username: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub rule: SubscribeRule,
}

/// A rule with its conditions ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: SubscribeRule,
    conditions: ConditionGroups,
}

impl CompiledRule {
    pub fn compile(rule: SubscribeRule) -> AssignResult<Self> {
        let conditions = ConditionGroups::compile(&rule.conditions)?;
        Ok(Self { rule, conditions })
    }

    pub fn is_match(&self, alert: &Alert) -> bool {
        self.conditions.is_match(alert)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribeRefreshStats {
    pub rows: usize,
    pub disabled: usize,
    pub malformed: usize,
    pub businesses: usize,
    pub users: usize,
    pub written: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

#[derive(Clone)]
enum Cached {
    Users(Arc<Vec<String>>),
    Rules(Arc<Vec<CompiledRule>>),
}

pub struct SubscribeCache {
    kv: SharedKv,
    /// Content written by the previous refresh; `None` until the first.
    prior: tokio::sync::Mutex<Option<HashMap<String, String>>>,
    local: Mutex<LruCache<String, (Instant, Cached)>>,
    max_age: Duration,
    stats: Arc<CacheStats>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl SubscribeCache {
    pub fn new(kv: SharedKv, capacity: NonZeroUsize, max_age: Duration) -> Self {
        Self {
            kv,
            prior: tokio::sync::Mutex::new(None),
            local: Mutex::new(LruCache::new(capacity)),
            max_age,
            stats: Arc::new(CacheStats::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        metrics.register_cache("subscribe", self.stats.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    // ── Refresh ────────────────────────────────────────────────

    /// Rebuild every `SUBSCRIBE.*` key from `NOTICE_SUBSCRIBE`.
    pub async fn refresh(&self) -> AssignResult<SubscribeRefreshStats> {
        let mut prior = self.prior.lock().await;
        let mut stats = SubscribeRefreshStats::default();

        let mut raw: Vec<(String, String)> = self.kv.hgetall(NOTICE_SUBSCRIBE).await?.into_iter().collect();
        raw.sort();
        stats.rows = raw.len();

        let mut groups: HashMap<i64, HashMap<String, Vec<String>>> = HashMap::new();
        let mut users: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
        let mut rules: BTreeMap<(i64, String), Vec<SubscribeRule>> = BTreeMap::new();
        for (id, json) in raw {
            let row: NoticeSubscribe = match serde_json::from_str(&json) {
                Ok(row) => row,
                Err(e) => {
                    stats.malformed += 1;
                    warn!(%id, error = %e, "skipping malformed subscription");
                    continue;
                }
            };
            if !row.enabled {
                stats.disabled += 1;
                continue;
            }
            if !groups.contains_key(&row.bk_biz_id) {
                let loaded = self.dynamic_groups(row.bk_biz_id).await?;
                groups.insert(row.bk_biz_id, loaded);
            }
            let mut rule = row.rule;
            if let Some(biz_groups) = groups.get(&row.bk_biz_id) {
                rule.conditions = resolve_dynamic_groups(rule.conditions, biz_groups);
            }
            if let Err(e) = ConditionGroups::compile(&rule.conditions) {
                stats.malformed += 1;
                warn!(%id, error = %e, "skipping subscription with invalid conditions");
                continue;
            }
            users
                .entry(row.bk_biz_id)
                .or_default()
                .insert(row.username.clone());
            rules.entry((row.bk_biz_id, row.username)).or_default().push(rule);
        }

        let mut desired = HashMap::new();
        for (biz, names) in &users {
            let names: Vec<&String> = names.iter().collect();
            desired.insert(keys::subscribe_biz(*biz), serde_json::to_string(&names)?);
        }
        for ((biz, username), list) in &mut rules {
            list.sort_by_key(|r| (Reverse(r.priority), r.id));
            desired.insert(keys::subscribe_user(*biz, username), serde_json::to_string(list)?);
        }
        stats.businesses = users.len();
        stats.users = rules.len();

        let previous = match prior.take() {
            Some(previous) => previous,
            None => self
                .kv
                .scan_match(&keys::subscribe_pattern())
                .await?
                .into_iter()
                .map(|key| (key, String::new()))
                .collect(),
        };

        let mut ops = Vec::new();
        for (key, value) in &desired {
            if previous.get(key) == Some(value) {
                stats.unchanged += 1;
                ops.push(KvOp::Expire {
                    key: key.clone(),
                    ttl_secs: SUBSCRIBE_TTL_SECS,
                });
            } else {
                stats.written += 1;
                ops.push(KvOp::Set {
                    key: key.clone(),
                    value: value.clone(),
                    ttl_secs: Some(SUBSCRIBE_TTL_SECS),
                });
            }
        }
        for key in previous.keys().filter(|k| !desired.contains_key(*k)) {
            stats.deleted += 1;
            ops.push(KvOp::Del { key: key.clone() });
        }
        if !ops.is_empty() {
            self.kv.pipeline(ops).await?;
        }
        *prior = Some(desired);
        drop(prior);

        self.invalidate();
        if let Some(metrics) = &self.metrics {
            metrics.cycle_succeeded("subscribe");
        }
        info!(
            rows = stats.rows,
            businesses = stats.businesses,
            users = stats.users,
            written = stats.written,
            unchanged = stats.unchanged,
            deleted = stats.deleted,
            malformed = stats.malformed,
            "subscribe refresh complete"
        );
        Ok(stats)
    }

    async fn dynamic_groups(&self, bk_biz_id: i64) -> AssignResult<HashMap<String, Vec<String>>> {
        let raw = self.kv.hgetall(&keys::dynamic_group(bk_biz_id)).await?;
        let mut out = HashMap::with_capacity(raw.len());
        for (group, json) in raw {
            match serde_json::from_str::<Vec<String>>(&json) {
                Ok(targets) => {
                    out.insert(group, targets);
                }
                Err(e) => warn!(bk_biz_id, %group, error = %e, "skipping malformed dynamic group"),
            }
        }
        Ok(out)
    }

    /// Refresh on a fixed cadence until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "subscribe refresher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "subscribe refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("subscribe refresher shutting down");
                    break;
                }
            }
        }
    }

    // ── Reads ──────────────────────────────────────────────────

    pub fn invalidate(&self) {
        let mut local = self.local.lock();
        local.clear();
        self.stats.set_size(0);
    }

    fn cached(&self, key: &str) -> Option<Cached> {
        let mut local = self.local.lock();
        let (loaded, value) = local.get(key)?;
        if loaded.elapsed() >= self.max_age {
            return None;
        }
        Some(value.clone())
    }

    fn store(&self, key: String, value: Cached) {
        let mut local = self.local.lock();
        local.put(key, (Instant::now(), value));
        self.stats.set_size(local.len());
    }

    /// Usernames subscribed in `bk_biz_id`, sorted.
    pub async fn biz_users(&self, bk_biz_id: i64) -> AssignResult<Arc<Vec<String>>> {
        let key = keys::subscribe_biz(bk_biz_id);
        if let Some(Cached::Users(users)) = self.cached(&key) {
            self.stats.hit();
            return Ok(users);
        }
        self.stats.miss();
        let users: Vec<String> = match self.kv.get(&key).await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| AssignError::Subscription {
                id: key.clone(),
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };
        let users = Arc::new(users);
        self.store(key, Cached::Users(users.clone()));
        Ok(users)
    }

    /// Rules of one user, highest priority first.
    pub async fn user_rules(&self, bk_biz_id: i64, username: &str) -> AssignResult<Arc<Vec<CompiledRule>>> {
        let key = keys::subscribe_user(bk_biz_id, username);
        if let Some(Cached::Rules(rules)) = self.cached(&key) {
            self.stats.hit();
            return Ok(rules);
        }
        self.stats.miss();
        let stored: Vec<SubscribeRule> = match self.kv.get(&key).await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| AssignError::Subscription {
                id: key.clone(),
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };
        let mut compiled = Vec::with_capacity(stored.len());
        for rule in stored {
            let id = rule.id;
            match CompiledRule::compile(rule) {
                Ok(rule) => compiled.push(rule),
                Err(e) => warn!(rule_id = id, %username, error = %e, "skipping uncompilable rule"),
            }
        }
        debug!(bk_biz_id, %username, rules = compiled.len(), "subscription rules loaded");
        let compiled = Arc::new(compiled);
        self.store(key, Cached::Rules(compiled.clone()));
        Ok(compiled)
    }
}

/// Replace `dynamic_group` conditions with the ip lists they stand for.
fn resolve_dynamic_groups(conditions: Vec<Condition>, groups: &HashMap<String, Vec<String>>) -> Vec<Condition> {
    conditions
        .into_iter()
        .map(|mut condition| {
            if condition.field != DYNAMIC_GROUP_FIELD {
                return condition;
            }
            let targets: BTreeSet<String> = condition
                .value
                .iter()
                .filter_map(|id| groups.get(id))
                .flatten()
                .cloned()
                .collect();
            condition.field = "ip".to_string();
            condition.method = match condition.method {
                Method::Neq | Method::Exclude => Method::Neq,
                _ => Method::Eq,
            };
            condition.value = targets.into_iter().collect();
            condition
        })
        .collect()
}
