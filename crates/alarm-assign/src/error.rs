//! Error types for assignment.

use alarm_kv::KvError;
use thiserror::Error;

pub type AssignResult<T> = Result<T, AssignError>;

#[derive(Debug, Error)]
pub enum AssignError {
    #[error("invalid condition on {field}: {reason}")]
    Condition { field: String, reason: String },

    #[error("malformed subscription {id}: {reason}")]
    Subscription { id: String, reason: String },

    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl AssignError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AssignError::Kv(e) if e.is_fatal())
    }
}
