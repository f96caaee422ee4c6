//! The `KvClient` seam.
//!
//! A deliberately small subset of Redis: strings, hashes, sorted sets,
//! pub/sub and non-transactional pipelines. Every pipeline stage talks
//! to the store through `Arc<dyn KvClient>`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::KvResult;

/// One write inside a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Set {
        key: String,
        value: String,
        ttl_secs: Option<u64>,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        ttl_secs: u64,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
    HMSet {
        key: String,
        pairs: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    ZAdd {
        key: String,
        members: Vec<(String, f64)>,
    },
    ZRemRangeByScore {
        key: String,
        min: f64,
        max: f64,
    },
    ZRemRangeByRank {
        key: String,
        start: i64,
        stop: i64,
    },
}

impl KvOp {
    pub fn key(&self) -> &str {
        match self {
            KvOp::Set { key, .. }
            | KvOp::Del { key }
            | KvOp::Expire { key, .. }
            | KvOp::HSet { key, .. }
            | KvOp::HMSet { key, .. }
            | KvOp::HDel { key, .. }
            | KvOp::ZAdd { key, .. }
            | KvOp::ZRemRangeByScore { key, .. }
            | KvOp::ZRemRangeByRank { key, .. } => key,
        }
    }
}

#[async_trait]
pub trait KvClient: Send + Sync {
    async fn ping(&self) -> KvResult<()>;

    // ── Strings ────────────────────────────────────────────────────

    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<()>;
    async fn del(&self, key: &str) -> KvResult<u64>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<bool>;
    /// `EXPIRE .. NX`: set the lifetime only when the key exists and has
    /// none. `true` when this call set it.
    async fn expire_nx(&self, key: &str, ttl_secs: u64) -> KvResult<bool>;
    /// Remaining lifetime in seconds; `None` when the key is missing or
    /// has no expiry.
    async fn ttl(&self, key: &str) -> KvResult<Option<i64>>;
    async fn decr_by(&self, key: &str, n: i64) -> KvResult<i64>;

    // ── Hashes ─────────────────────────────────────────────────────

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;
    /// Returns 1 when the field is new.
    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<u64>;
    async fn hmset(&self, key: &str, pairs: &[(String, String)]) -> KvResult<()>;
    async fn hmget(&self, key: &str, fields: &[String]) -> KvResult<Vec<Option<String>>>;
    async fn hdel(&self, key: &str, fields: &[String]) -> KvResult<u64>;
    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>>;

    // ── Sorted sets ────────────────────────────────────────────────

    /// Returns the number of members that were not present before.
    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> KvResult<u64>;
    async fn zrem(&self, key: &str, members: &[String]) -> KvResult<u64>;
    /// Removes members with `min <= score <= max`.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64>;
    /// Removes by rank, Redis index semantics (negative counts from the end).
    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> KvResult<u64>;
    async fn zrange_withscores(&self, key: &str, start: i64, stop: i64)
    -> KvResult<Vec<(String, f64)>>;
    async fn zcard(&self, key: &str) -> KvResult<u64>;

    // ── Keyspace / pubsub ──────────────────────────────────────────

    async fn scan_match(&self, pattern: &str) -> KvResult<Vec<String>>;
    async fn publish(&self, channel: &str, payload: &str) -> KvResult<u64>;
    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::Receiver<String>>;

    /// Run `ops` in order without a transaction. One result per op: the
    /// count the equivalent single command would have returned.
    async fn pipeline(&self, ops: Vec<KvOp>) -> KvResult<Vec<i64>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(apply_op(self, op).await?);
        }
        Ok(results)
    }
}

pub type SharedKv = Arc<dyn KvClient>;

/// Execute one pipeline op through the single-command API.
pub async fn apply_op<K: KvClient + ?Sized>(kv: &K, op: KvOp) -> KvResult<i64> {
    let n = match op {
        KvOp::Set {
            key,
            value,
            ttl_secs,
        } => {
            kv.set(&key, &value, ttl_secs).await?;
            1
        }
        KvOp::Del { key } => kv.del(&key).await? as i64,
        KvOp::Expire { key, ttl_secs } => kv.expire(&key, ttl_secs).await? as i64,
        KvOp::HSet { key, field, value } => kv.hset(&key, &field, &value).await? as i64,
        KvOp::HMSet { key, pairs } => {
            kv.hmset(&key, &pairs).await?;
            1
        }
        KvOp::HDel { key, fields } => kv.hdel(&key, &fields).await? as i64,
        KvOp::ZAdd { key, members } => kv.zadd(&key, &members).await? as i64,
        KvOp::ZRemRangeByScore { key, min, max } => {
            kv.zremrangebyscore(&key, min, max).await? as i64
        }
        KvOp::ZRemRangeByRank { key, start, stop } => {
            kv.zremrangebyrank(&key, start, stop).await? as i64
        }
    };
    Ok(n)
}
