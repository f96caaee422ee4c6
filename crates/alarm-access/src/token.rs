//! Per-query token bucket.
//!
//! One integer counter per `query_md5` in KV whose TTL is the refill
//! window. DECRBY is linearizable on a single key, so concurrent workers
//! never oversubscribe a window. A counter without a TTL (never filled,
//! or filled by a client that lost its EXPIRE) is treated as expired and
//! refilled from the configured capacity. `EXPIRE .. NX` picks the one
//! worker that refills it.

use alarm_core::config::TokenSettings;
use alarm_kv::{keys, KvResult, SharedKv};
use tracing::debug;

/// Result of asking for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenDecision {
    Admitted { remaining: i64 },
    Exhausted { remaining: i64, ttl: i64 },
}

impl TokenDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Counter state as reported by [`TokenBucket::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenEntry {
    pub query_md5: String,
    pub remaining: i64,
    pub ttl: Option<i64>,
}

impl TokenEntry {
    pub fn is_exhausted(&self) -> bool {
        self.remaining <= 0
    }
}

#[derive(Clone)]
pub struct TokenBucket {
    kv: SharedKv,
    capacity: i64,
    window_secs: u64,
}

impl TokenBucket {
    pub fn new(kv: SharedKv, settings: &TokenSettings) -> Self {
        Self {
            kv,
            capacity: settings.capacity,
            window_secs: settings.window_secs,
        }
    }

    /// Subtract `n` and report the new remaining count with the key TTL.
    pub async fn try_consume(&self, query_md5: &str, n: i64) -> KvResult<(i64, Option<i64>)> {
        let key = keys::token(query_md5);
        let remaining = self.kv.decr_by(&key, n).await?;
        let ttl = self.kv.ttl(&key).await?;
        Ok((remaining, ttl))
    }

    /// Reset the counter to `capacity` for a fresh `window_secs` window.
    pub async fn refill(&self, query_md5: &str, capacity: i64, window_secs: u64) -> KvResult<()> {
        self.kv
            .set(&keys::token(query_md5), &capacity.to_string(), Some(window_secs))
            .await
    }

    /// Consume one token for `query_md5`, refilling when the window is
    /// unknown.
    pub async fn admit(&self, query_md5: &str) -> KvResult<TokenDecision> {
        let (remaining, ttl) = self.try_consume(query_md5, 1).await?;
        match ttl {
            None => self.open_window(query_md5).await,
            Some(ttl) => Ok(self.decide(remaining, ttl)),
        }
    }

    /// Only the caller that gives the counter its TTL refills it. The
    /// others consume from whatever window that opens.
    async fn open_window(&self, query_md5: &str) -> KvResult<TokenDecision> {
        let key = keys::token(query_md5);
        if self.kv.expire_nx(&key, self.window_secs).await? {
            debug!(%query_md5, capacity = self.capacity, "token window unknown, refilling");
            self.refill(query_md5, self.capacity, self.window_secs).await?;
        }
        let (remaining, ttl) = self.try_consume(query_md5, 1).await?;
        Ok(self.decide(remaining, ttl.unwrap_or(self.window_secs as i64)))
    }

    fn decide(&self, remaining: i64, ttl: i64) -> TokenDecision {
        if remaining < 0 {
            TokenDecision::Exhausted { remaining, ttl }
        } else {
            TokenDecision::Admitted { remaining }
        }
    }

    /// Every token counter currently in KV, sorted by query.
    pub async fn list(&self) -> KvResult<Vec<TokenEntry>> {
        let mut found = Vec::new();
        for key in self.kv.scan_match(&keys::token_pattern()).await? {
            let Some(query_md5) = keys::parse_token(&key) else {
                continue;
            };
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let Ok(remaining) = raw.parse::<i64>() else {
                continue;
            };
            found.push(TokenEntry {
                query_md5: query_md5.to_string(),
                remaining,
                ttl: self.kv.ttl(&key).await?,
            });
        }
        found.sort_by(|a, b| a.query_md5.cmp(&b.query_md5));
        Ok(found)
    }
}
