//! Error types for detection and emission.

use alarm_kv::KvError;
use thiserror::Error;

pub type DetectResult<T> = Result<T, DetectError>;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("invalid {algorithm} config: {reason}")]
    Config { algorithm: String, reason: String },

    #[error("unsupported algorithm: {0}")]
    Unsupported(String),

    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl DetectError {
    pub(crate) fn config(algorithm: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            algorithm: algorithm.to_string(),
            reason: reason.into(),
        }
    }
}
