//! Error types for the access stage.

use alarm_kv::KvError;
use thiserror::Error;

pub type AccessResult<T> = Result<T, AccessError>;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("kv error: {0}")]
    Kv(#[from] KvError),
}
