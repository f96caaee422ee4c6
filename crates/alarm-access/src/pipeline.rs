//! The access stage as one call per batch.
//!
//! Every gate either drops a whole record or releases some of its items
//! (`is_retains[item] = false`, `inhibitions[item] = true`). Records left
//! with no active item are dropped and counted under the reason of the
//! gate that released their last item.

use std::collections::BTreeSet;
use std::sync::Arc;

use alarm_core::{AccessRecord, AlarmConfig, DataRecord, EventRecord, SharedClock};
use alarm_kv::{KvError, SharedKv};
use alarm_metrics::{DropReason, PipelineMetrics};
use alarm_strategy::{StrategyCache, StrategySnapshot};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::duplicate::DuplicateFilter;
use crate::error::AccessError;
use crate::filters::{ExpireFilter, RangeFilter, TimePointLimiter};
use crate::priority::PriorityChecker;
use crate::records::{parse_event, parse_point};
use crate::token::TokenBucket;

const STAGE: &str = "access";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccessStats {
    pub received: usize,
    pub malformed: usize,
    pub strategy_missing: usize,
    pub expired: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub out_of_range: usize,
    pub inhibited: usize,
    pub token_exhausted: usize,
    pub kv_errors: usize,
    pub accepted: usize,
}

/// Records that passed the stage, pinned to the snapshot they were
/// judged against.
#[derive(Debug)]
pub struct AccessOutput<R> {
    pub snapshot: Arc<StrategySnapshot>,
    pub records: Vec<R>,
    /// Newer time points held back by the time-point limiter; feed them
    /// to [`AccessPipeline::resume_points`].
    pub deferred: Vec<R>,
    pub stats: AccessStats,
    /// Set when the KV backend has been gone past its grace window.
    pub fatal: Option<KvError>,
}

pub struct AccessPipeline {
    kv: SharedKv,
    strategies: Arc<StrategyCache>,
    tokens: TokenBucket,
    priority: PriorityChecker,
    clock: SharedClock,
    metrics: Arc<PipelineMetrics>,
    expire: ExpireFilter,
    limiter: TimePointLimiter,
}

impl AccessPipeline {
    pub fn new(
        kv: SharedKv,
        strategies: Arc<StrategyCache>,
        clock: SharedClock,
        metrics: Arc<PipelineMetrics>,
        config: &AlarmConfig,
    ) -> Self {
        Self {
            tokens: TokenBucket::new(kv.clone(), &config.token),
            priority: PriorityChecker::new(kv.clone(), clock.clone()).with_metrics(metrics.clone()),
            expire: ExpireFilter {
                expire_secs: config.access.expire_secs,
            },
            limiter: TimePointLimiter {
                max_time_points: config.access.max_time_points,
            },
            kv,
            strategies,
            clock,
            metrics,
        }
    }

    pub fn tokens(&self) -> &TokenBucket {
        &self.tokens
    }

    // ── Points ──────────────────────────────────────────────────

    pub async fn ingest_points(&self, raw: &[Value]) -> AccessOutput<DataRecord> {
        let snapshot = self.strategies.pinned().await;
        let mut stats = AccessStats {
            received: raw.len(),
            ..AccessStats::default()
        };
        self.metrics.record_received(STAGE, raw.len() as u64);

        let mut records = Vec::with_capacity(raw.len());
        for value in raw {
            match parse_point(value, &snapshot) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.malformed(&e);
                    stats.malformed += 1;
                }
            }
        }
        self.run_points(snapshot, records, stats).await
    }

    /// Re-run records deferred by an earlier batch against the current
    /// snapshot.
    pub async fn resume_points(&self, records: Vec<DataRecord>) -> AccessOutput<DataRecord> {
        let snapshot = self.strategies.pinned().await;
        self.run_points(snapshot, records, AccessStats::default()).await
    }

    async fn run_points(
        &self,
        snapshot: Arc<StrategySnapshot>,
        mut records: Vec<DataRecord>,
        mut stats: AccessStats,
    ) -> AccessOutput<DataRecord> {
        let mut fatal = None;

        stats.strategy_missing += self.reconcile(&snapshot, &mut records);
        stats.expired += self.drop_expired(&mut records);

        let (mut records, deferred, _) = self.limit_time_points(&snapshot, records);
        stats.deferred += deferred.len();
        let duplicates = self
            .filter_duplicates(&snapshot, &mut records, &mut stats, &mut fatal)
            .await;
        stats.duplicates += duplicates;
        let dropped_duplicates = duplicates - records.iter().filter(|r| r.is_duplicate).count();

        for record in records.iter_mut() {
            stats.out_of_range += RangeFilter.apply(&snapshot, record);
        }
        self.drop_inactive(&mut records, DropReason::OutOfRange);

        stats.inhibited += self
            .priority
            .check_records(&snapshot, &mut records)
            .await
            .inhibited;

        // Duplicates in priority groups stayed for the priority check and
        // leave now; the others were dropped by the filter.
        let before = records.len();
        records.retain(|r| !r.is_duplicate);
        self.metrics.record_dropped_n(
            STAGE,
            DropReason::Duplicate,
            (dropped_duplicates + before - records.len()) as u64,
        );
        self.drop_inactive(&mut records, DropReason::Inhibited);

        let records = self
            .admit_tokens(&snapshot, records, &mut stats, &mut fatal)
            .await;
        stats.accepted = records.len();
        debug!(
            received = stats.received,
            accepted = stats.accepted,
            deferred = stats.deferred,
            "access batch done"
        );
        AccessOutput {
            snapshot,
            records,
            deferred,
            stats,
            fatal,
        }
    }

    /// Drops repeated points, except in priority groups where they are
    /// flagged `is_duplicate` instead. Returns how many repeats were seen.
    async fn filter_duplicates(
        &self,
        snapshot: &StrategySnapshot,
        records: &mut Vec<DataRecord>,
        stats: &mut AccessStats,
        fatal: &mut Option<KvError>,
    ) -> usize {
        let max_interval = records
            .iter()
            .flat_map(|r| r.matches.items.iter())
            .filter_map(|k| snapshot.item(*k))
            .map(|r| r.item.interval)
            .max()
            .unwrap_or(60);
        let mut filter = DuplicateFilter::new(self.kv.clone(), max_interval * 10);
        let mut duplicates = 0;
        let mut kept = Vec::with_capacity(records.len());

        // Newest first, so the freshest copy of a repeated point wins.
        for mut record in records.drain(..).rev() {
            let group = duplicate_group(snapshot, &record);
            let in_priority_group = record
                .matches
                .items
                .iter()
                .filter_map(|k| snapshot.item(*k))
                .any(|r| r.strategy.in_priority_group());
            let seen = match filter.is_duplicate(&group, record.time, &record.record_id).await {
                Ok(seen) => seen,
                Err(e) => {
                    self.kv_failed(&e, stats, fatal);
                    false
                }
            };
            if seen {
                duplicates += 1;
                if in_priority_group {
                    record.is_duplicate = true;
                    kept.push(record);
                }
            } else {
                filter.add(&group, record.time, &record.record_id);
                kept.push(record);
            }
        }
        kept.reverse();
        *records = kept;

        if let Err(e) = filter.flush().await {
            warn!(error = %e, "duplicate ids not saved");
            self.kv_failed(&e, stats, fatal);
        }
        duplicates
    }

    fn limit_time_points(
        &self,
        snapshot: &StrategySnapshot,
        records: Vec<DataRecord>,
    ) -> (Vec<DataRecord>, Vec<DataRecord>, Option<i64>) {
        let (series, other): (Vec<DataRecord>, Vec<DataRecord>) =
            records.into_iter().partition(|r| {
                r.matches
                    .items
                    .first()
                    .and_then(|k| snapshot.item(*k))
                    .is_some_and(|r| r.item.is_time_series())
            });
        let (mut kept, deferred, last) = self.limiter.limit(series);
        kept.extend(other);
        self.metrics.record_dropped_n(
            STAGE,
            DropReason::TimePointLimit,
            deferred.len() as u64,
        );
        (kept, deferred, last)
    }

    async fn admit_tokens(
        &self,
        snapshot: &StrategySnapshot,
        records: Vec<DataRecord>,
        stats: &mut AccessStats,
        fatal: &mut Option<KvError>,
    ) -> Vec<DataRecord> {
        let mut kept = Vec::with_capacity(records.len());
        for mut record in records {
            let mut reason = DropReason::TokenExhausted;
            let groups: BTreeSet<String> = record
                .matches
                .active()
                .filter_map(|k| snapshot.item(k))
                .map(|r| r.item.query_md5.clone())
                .filter(|q| !q.is_empty())
                .collect();
            for query_md5 in groups {
                reason = match self.tokens.admit(&query_md5).await {
                    Ok(decision) if decision.is_admitted() => continue,
                    Ok(_) => {
                        self.metrics.token_exhausted(&query_md5);
                        stats.token_exhausted += 1;
                        DropReason::TokenExhausted
                    }
                    Err(e) => {
                        self.kv_failed(&e, stats, fatal);
                        if matches!(e, KvError::Timeout(_)) {
                            DropReason::KvTimeout
                        } else {
                            DropReason::KvError
                        }
                    }
                };
                let released: Vec<u64> = record
                    .matches
                    .items
                    .iter()
                    .filter_map(|k| snapshot.item(*k))
                    .filter(|r| r.item.query_md5 == query_md5)
                    .map(|r| r.item.id)
                    .collect();
                for item_id in released {
                    record.matches.set_retained(item_id, false);
                }
            }
            if record.matches.has_active() {
                kept.push(record);
            } else {
                self.metrics.record_dropped(STAGE, reason);
            }
        }
        kept
    }

    // ── Events ──────────────────────────────────────────────────

    pub async fn ingest_events(&self, raw: &[Value]) -> AccessOutput<EventRecord> {
        let snapshot = self.strategies.pinned().await;
        let mut stats = AccessStats {
            received: raw.len(),
            ..AccessStats::default()
        };
        self.metrics.record_received(STAGE, raw.len() as u64);

        let mut records = Vec::with_capacity(raw.len());
        for value in raw {
            match parse_event(value, &snapshot) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.malformed(&e);
                    stats.malformed += 1;
                }
            }
        }
        stats.strategy_missing += self.reconcile(&snapshot, &mut records);
        stats.expired += self.drop_expired(&mut records);
        stats.inhibited += self
            .priority
            .check_records(&snapshot, &mut records)
            .await
            .inhibited;
        self.drop_inactive(&mut records, DropReason::Inhibited);
        stats.accepted = records.len();
        AccessOutput {
            snapshot,
            records,
            deferred: Vec::new(),
            stats,
            fatal: None,
        }
    }

    // ── Shared gates ────────────────────────────────────────────

    /// Release items the snapshot no longer knows and drop records left
    /// with none.
    fn reconcile<R: AccessRecord>(&self, snapshot: &StrategySnapshot, records: &mut Vec<R>) -> usize {
        for record in records.iter_mut() {
            let unknown: Vec<u64> = record
                .matches()
                .items
                .iter()
                .filter(|k| snapshot.item(**k).is_none())
                .map(|k| k.item_id)
                .collect();
            for item_id in unknown {
                record.matches_mut().set_retained(item_id, false);
            }
        }
        self.drop_inactive(records, DropReason::StrategyMissing)
    }

    fn drop_expired<R: AccessRecord>(&self, records: &mut Vec<R>) -> usize {
        let now = self.clock.now_secs();
        let before = records.len();
        records.retain(|r| !self.expire.is_expired(r.time(), now));
        let dropped = before - records.len();
        self.metrics
            .record_dropped_n(STAGE, DropReason::Expired, dropped as u64);
        dropped
    }

    fn drop_inactive<R: AccessRecord>(&self, records: &mut Vec<R>, reason: DropReason) -> usize {
        let before = records.len();
        records.retain(|r| r.matches().has_active());
        let dropped = before - records.len();
        self.metrics.record_dropped_n(STAGE, reason, dropped as u64);
        dropped
    }

    fn malformed(&self, error: &AccessError) {
        warn!(error = %error, "malformed record dropped");
        self.metrics.record_dropped(STAGE, DropReason::Malformed);
    }

    fn kv_failed(&self, error: &KvError, stats: &mut AccessStats, fatal: &mut Option<KvError>) {
        stats.kv_errors += 1;
        self.metrics.kv_error(STAGE, error.kind());
        if error.is_fatal() && fatal.is_none() {
            info!(error = %error, "kv backend unavailable past grace window");
            *fatal = Some(error.clone());
        }
    }
}

fn duplicate_group(snapshot: &StrategySnapshot, record: &DataRecord) -> String {
    match record.matches.items.first().and_then(|k| snapshot.item(*k)) {
        Some(r) if !r.item.query_md5.is_empty() => r.item.query_md5.clone(),
        Some(r) => format!("strategy_{}", r.strategy.id),
        None => "unmatched".to_string(),
    }
}
