//! Error types for the strategy cache.

use alarm_kv::KvError;
use thiserror::Error;

pub type StrategyResult<T> = Result<T, StrategyError>;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy source failed: {0}")]
    Source(String),

    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("failed to parse strategies: {0}")]
    Parse(String),
}
