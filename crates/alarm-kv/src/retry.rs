//! Deadline, retry and outage tracking around any `KvClient`.
//!
//! Transient errors are retried at most `max_retries` times with a
//! jittered exponential backoff. Timeouts are not retried. Once the
//! backend has failed continuously for longer than the grace window,
//! every call reports [`KvError::Unavailable`] until one succeeds again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::client::{KvClient, KvOp};
use crate::error::{KvError, KvResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Continuous failure time after which the backend counts as down.
    pub grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            timeout: Duration::from_millis(2000),
            grace: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(timeout: Duration, grace: Duration) -> Self {
        Self {
            timeout,
            grace,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based), with up to 50% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let jitter_ms = fastrand::u64(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Tracks how long the backend has been failing.
#[derive(Debug, Default)]
pub struct OutageTracker {
    failing_since: Option<Instant>,
    consecutive_failures: u32,
}

impl OutageTracker {
    pub fn record_success(&mut self) {
        if self.failing_since.is_some() {
            debug!(
                failures = self.consecutive_failures,
                "kv backend recovered"
            );
        }
        self.failing_since = None;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.failing_since.get_or_insert(now);
    }

    pub fn outage(&self, now: Instant) -> Option<Duration> {
        self.failing_since.map(|since| now.saturating_duration_since(since))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

pub struct RetryingKv<K> {
    inner: K,
    policy: RetryPolicy,
    outage: Mutex<OutageTracker>,
}

impl<K: KvClient> RetryingKv<K> {
    pub fn new(inner: K, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            outage: Mutex::new(OutageTracker::default()),
        }
    }

    pub fn inner(&self) -> &K {
        &self.inner
    }

    /// How long the backend has been failing, if it is.
    pub fn outage(&self) -> Option<Duration> {
        self.outage
            .lock()
            .expect("outage lock")
            .outage(Instant::now())
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> KvResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        self.call_with(op, self.policy.max_retries, f).await
    }

    async fn call_with<T, F, Fut>(&self, op: &'static str, max_retries: u32, f: F) -> KvResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = KvResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.policy.timeout, f()).await {
                Ok(r) => r,
                Err(_) => Err(KvError::Timeout(format!(
                    "{op} exceeded {}ms",
                    self.policy.timeout.as_millis()
                ))),
            };
            match result {
                Ok(value) => {
                    self.outage.lock().expect("outage lock").record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let delay = self.policy.backoff(attempt);
                    debug!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying kv call");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(self.classify(op, e)),
            }
        }
    }

    /// Fold a final failure into the outage window.
    fn classify(&self, op: &'static str, e: KvError) -> KvError {
        if !e.is_connectivity() {
            return e;
        }
        let now = Instant::now();
        let mut tracker = self.outage.lock().expect("outage lock");
        tracker.record_failure(now);
        match tracker.outage(now) {
            Some(down) if down >= self.policy.grace => {
                error!(op, down_secs = down.as_secs(), error = %e, "kv backend unavailable");
                KvError::Unavailable(format!("down for {}s: {e}", down.as_secs()))
            }
            _ => {
                warn!(op, error = %e, "kv call failed after retries");
                e
            }
        }
    }
}

#[async_trait]
impl<K: KvClient> KvClient for RetryingKv<K> {
    async fn ping(&self) -> KvResult<()> {
        self.call("ping", || self.inner.ping()).await
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.call("get", || self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<()> {
        self.call("set", || self.inner.set(key, value, ttl_secs)).await
    }

    async fn del(&self, key: &str) -> KvResult<u64> {
        self.call("del", || self.inner.del(key)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<bool> {
        self.call("expire", || self.inner.expire(key, ttl_secs)).await
    }

    async fn expire_nx(&self, key: &str, ttl_secs: u64) -> KvResult<bool> {
        // A lost reply would hide that this call won.
        self.call_with("expire_nx", 0, || self.inner.expire_nx(key, ttl_secs))
            .await
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<i64>> {
        self.call("ttl", || self.inner.ttl(key)).await
    }

    async fn decr_by(&self, key: &str, n: i64) -> KvResult<i64> {
        // A lost reply would make a retry consume twice.
        self.call_with("decr_by", 0, || self.inner.decr_by(key, n))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.call("hget", || self.inner.hget(key, field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<u64> {
        self.call("hset", || self.inner.hset(key, field, value)).await
    }

    async fn hmset(&self, key: &str, pairs: &[(String, String)]) -> KvResult<()> {
        self.call("hmset", || self.inner.hmset(key, pairs)).await
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> KvResult<Vec<Option<String>>> {
        self.call("hmget", || self.inner.hmget(key, fields)).await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> KvResult<u64> {
        self.call("hdel", || self.inner.hdel(key, fields)).await
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        self.call("hgetall", || self.inner.hgetall(key)).await
    }

    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> KvResult<u64> {
        self.call("zadd", || self.inner.zadd(key, members)).await
    }

    async fn zrem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        self.call("zrem", || self.inner.zrem(key, members)).await
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        self.call("zremrangebyscore", || {
            self.inner.zremrangebyscore(key, min, max)
        })
        .await
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> KvResult<u64> {
        self.call("zremrangebyrank", || {
            self.inner.zremrangebyrank(key, start, stop)
        })
        .await
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> KvResult<Vec<(String, f64)>> {
        self.call("zrange", || self.inner.zrange_withscores(key, start, stop))
            .await
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        self.call("zcard", || self.inner.zcard(key)).await
    }

    async fn scan_match(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.call("scan", || self.inner.scan_match(pattern)).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<u64> {
        self.call("publish", || self.inner.publish(channel, payload))
            .await
    }

    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::Receiver<String>> {
        self.call("subscribe", || self.inner.subscribe(channel)).await
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> KvResult<Vec<i64>> {
        self.call("pipeline", || self.inner.pipeline(ops.clone()))
            .await
    }
}
