//! Stateless access filters.

use std::collections::BTreeSet;

use alarm_core::{AccessRecord, DataRecord};
use alarm_strategy::StrategySnapshot;
use tracing::info;

/// Drops points older than the access horizon.
#[derive(Debug, Clone, Copy)]
pub struct ExpireFilter {
    pub expire_secs: u64,
}

impl ExpireFilter {
    pub fn is_expired(&self, time: i64, now: i64) -> bool {
        time < now - self.expire_secs as i64
    }
}

/// Releases items whose `value_range` excludes the point's value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeFilter;

impl RangeFilter {
    /// Returns how many items were released.
    pub fn apply(&self, snapshot: &StrategySnapshot, record: &mut DataRecord) -> usize {
        let Some(value) = record.primary_value() else {
            return 0;
        };
        let out_of_range: Vec<u64> = record
            .matches
            .items
            .iter()
            .filter_map(|k| snapshot.item(*k))
            .filter(|r| r.item.value_range.as_ref().is_some_and(|range| !range.contains(value)))
            .map(|r| r.item.id)
            .collect();
        for item_id in &out_of_range {
            record.matches.set_retained(*item_id, false);
        }
        out_of_range.len()
    }
}

/// Caps how many distinct timestamps one batch may carry forward.
#[derive(Debug, Clone, Copy)]
pub struct TimePointLimiter {
    pub max_time_points: usize,
}

impl TimePointLimiter {
    /// Split `records` into the oldest `max_time_points` timestamps and
    /// the rest. Every series of a kept timestamp is kept whole. Also
    /// returns the newest kept timestamp when the limit was hit.
    pub fn limit<R: AccessRecord>(&self, records: Vec<R>) -> (Vec<R>, Vec<R>, Option<i64>) {
        let times: BTreeSet<i64> = records.iter().map(|r| r.time()).collect();
        if self.max_time_points == 0 || times.len() <= self.max_time_points {
            return (records, Vec::new(), None);
        }
        let Some(last_kept) = times.iter().nth(self.max_time_points - 1).copied() else {
            return (records, Vec::new(), None);
        };
        let total = records.len();
        let (kept, deferred): (Vec<R>, Vec<R>) =
            records.into_iter().partition(|r| r.time() <= last_kept);
        info!(
            time_points = times.len(),
            processed = self.max_time_points,
            last_time_point = last_kept,
            records = total,
            kept = kept.len(),
            "time points limited"
        );
        (kept, deferred, Some(last_kept))
    }
}
