//! Error types for KV access.

use thiserror::Error;

/// Result type alias for KV operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur talking to the shared KV store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KvError {
    /// Connection reset, refused, I/O. Safe to retry.
    #[error("transient kv error: {0}")]
    Transient(String),

    /// The call did not finish before its deadline. Not retried.
    #[error("kv call timed out: {0}")]
    Timeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// The backend has been unreachable for longer than the grace window.
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Transient(_))
    }

    /// Errors that count toward a backend outage.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            KvError::Transient(_) | KvError::Timeout(_) | KvError::Unavailable(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, KvError::Unavailable(_))
    }

    /// Short label used as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            KvError::Transient(_) => "transient",
            KvError::Timeout(_) => "timeout",
            KvError::Protocol(_) => "protocol",
            KvError::Serialize(_) => "serialize",
            KvError::Deserialize(_) => "deserialize",
            KvError::Unavailable(_) => "unavailable",
            KvError::Invalid(_) => "invalid",
            KvError::NotFound(_) => "not_found",
        }
    }
}
