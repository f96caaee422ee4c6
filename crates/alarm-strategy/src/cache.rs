//! Strategy cache with atomic snapshot swaps.
//!
//! Readers call [`StrategyCache::pinned`] once per batch and keep the
//! returned `Arc` until the batch is done. A refresh builds a complete
//! new snapshot off to the side and swaps it in under a short write
//! lock; a failed refresh leaves the previous snapshot serving.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use alarm_core::{Strategy, StrategyId, clock::epoch_secs};
use alarm_metrics::{CacheStats, PipelineMetrics};
use tracing::{debug, info, warn};

use crate::error::StrategyResult;
use crate::snapshot::StrategySnapshot;
use crate::source::StrategySource;

/// Outcome of one refresh.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshStats {
    pub strategies: usize,
    pub items: usize,
    pub added: usize,
    pub removed: usize,
    pub skipped: usize,
}

pub struct StrategyCache {
    source: Arc<dyn StrategySource>,
    current: RwLock<Arc<StrategySnapshot>>,
    generation: AtomicU64,
    stale: AtomicBool,
    refresh_gate: tokio::sync::Mutex<()>,
    stats: Arc<CacheStats>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl StrategyCache {
    /// Create an empty cache; it is marked stale so the first read loads.
    pub fn new(source: Arc<dyn StrategySource>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(StrategySnapshot::empty())),
            generation: AtomicU64::new(0),
            stale: AtomicBool::new(true),
            refresh_gate: tokio::sync::Mutex::new(()),
            stats: Arc::new(CacheStats::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        metrics.register_cache("strategy", self.stats.clone());
        self.metrics = Some(metrics);
        self
    }

    /// The snapshot currently installed, without triggering a reload.
    pub fn snapshot(&self) -> Arc<StrategySnapshot> {
        self.current.read().expect("snapshot lock").clone()
    }

    /// The snapshot to use for one batch. Reloads first when the cache
    /// was invalidated; a failed reload falls back to the old snapshot.
    pub async fn pinned(&self) -> Arc<StrategySnapshot> {
        if self.stale.load(Ordering::Acquire) {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "strategy reload failed, serving previous snapshot");
            }
        }
        self.snapshot()
    }

    /// Force the next read to reload from the source.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
        debug!("strategy cache invalidated");
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub async fn list_ids(&self) -> BTreeSet<StrategyId> {
        self.pinned().await.ids()
    }

    /// Fetch the given strategies. Unknown ids are absent from the result.
    pub async fn get_by_ids(&self, ids: &[StrategyId]) -> HashMap<StrategyId, Strategy> {
        let snapshot = self.pinned().await;
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            match snapshot.get(*id) {
                Some(strategy) => {
                    self.stats.hit();
                    found.insert(*id, strategy.clone());
                }
                None => self.stats.miss(),
            }
        }
        found
    }

    /// Load from the source and install a new snapshot.
    pub async fn refresh(&self) -> StrategyResult<RefreshStats> {
        let _gate = self.refresh_gate.lock().await;
        let strategies = self.source.load().await?;

        let version = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (next, skipped) = StrategySnapshot::build(strategies, version, epoch_secs() as i64);
        let next = Arc::new(next);

        let previous = {
            let mut current = self.current.write().expect("snapshot lock");
            std::mem::replace(&mut *current, next.clone())
        };
        self.stale.store(false, Ordering::Release);
        self.stats.set_size(next.len());

        let before = previous.ids();
        let after = next.ids();
        let stats = RefreshStats {
            strategies: next.len(),
            items: next.item_count(),
            added: after.difference(&before).count(),
            removed: before.difference(&after).count(),
            skipped,
        };
        if let Some(metrics) = &self.metrics {
            metrics.cycle_succeeded("strategy_cache");
        }
        info!(
            source = self.source.name(),
            version,
            strategies = stats.strategies,
            items = stats.items,
            added = stats.added,
            removed = stats.removed,
            skipped = stats.skipped,
            "strategy refresh complete"
        );
        Ok(stats)
    }

    /// Refresh on a fixed cadence until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "strategy refresher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "strategy refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("strategy refresher shutting down");
                    break;
                }
            }
        }
    }
}
