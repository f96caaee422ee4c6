//! Where strategy definitions come from.

use std::path::PathBuf;
use std::sync::RwLock;

use alarm_core::Strategy;
use alarm_kv::{keys, SharedKv};
use async_trait::async_trait;
use tracing::warn;

use crate::error::{StrategyError, StrategyResult};

#[async_trait]
pub trait StrategySource: Send + Sync {
    /// Load the full current strategy set.
    async fn load(&self) -> StrategyResult<Vec<Strategy>>;

    fn name(&self) -> &'static str;
}

/// Reads the `bkmonitor.STRATEGY` hash (strategy id → JSON definition).
/// Entries that fail to parse are skipped so one bad definition does not
/// hide every other strategy.
pub struct KvStrategySource {
    kv: SharedKv,
}

impl KvStrategySource {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl StrategySource for KvStrategySource {
    async fn load(&self) -> StrategyResult<Vec<Strategy>> {
        let raw = self.kv.hgetall(keys::STRATEGY).await?;
        let mut strategies: Vec<Strategy> = raw
            .into_iter()
            .filter_map(|(field, body)| match serde_json::from_str::<Strategy>(&body) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(field = %field, error = %e, "malformed strategy entry skipped");
                    None
                }
            })
            .collect();
        strategies.sort_by_key(|s| s.id);
        Ok(strategies)
    }

    fn name(&self) -> &'static str {
        "kv"
    }
}

/// Reads a JSON array of strategies from disk.
pub struct FileStrategySource {
    path: PathBuf,
}

impl FileStrategySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StrategySource for FileStrategySource {
    async fn load(&self) -> StrategyResult<Vec<Strategy>> {
        let body = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StrategyError::Source(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&body)
            .map_err(|e| StrategyError::Parse(format!("{}: {e}", self.path.display())))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// In-process strategy set, replaced wholesale with [`set`](Self::set).
#[derive(Default)]
pub struct StaticStrategySource {
    strategies: RwLock<Vec<Strategy>>,
    failing: RwLock<Option<String>>,
}

impl StaticStrategySource {
    pub fn new(strategies: Vec<Strategy>) -> Self {
        Self {
            strategies: RwLock::new(strategies),
            failing: RwLock::new(None),
        }
    }

    pub fn set(&self, strategies: Vec<Strategy>) {
        *self.strategies.write().expect("strategies lock") = strategies;
    }

    /// Make every following load fail with `reason` (`None` to recover).
    pub fn set_failing(&self, reason: Option<&str>) {
        *self.failing.write().expect("failing lock") = reason.map(str::to_string);
    }
}

#[async_trait]
impl StrategySource for StaticStrategySource {
    async fn load(&self) -> StrategyResult<Vec<Strategy>> {
        if let Some(reason) = self.failing.read().expect("failing lock").clone() {
            return Err(StrategyError::Source(reason));
        }
        Ok(self.strategies.read().expect("strategies lock").clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
