//! Redis-backed `KvClient`.
//!
//! Commands go through a `ConnectionManager`, which reconnects on its
//! own; pub/sub opens a dedicated connection per subscription.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::{KvClient, KvOp};
use crate::error::{KvError, KvResult};

const SCAN_COUNT: usize = 500;
const SUBSCRIBE_CAPACITY: usize = 1024;

fn map_redis_err(e: RedisError) -> KvError {
    if e.is_timeout() {
        KvError::Timeout(e.to_string())
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        KvError::Transient(e.to_string())
    } else {
        KvError::Protocol(e.to_string())
    }
}

#[derive(Clone)]
pub struct RedisKv {
    client: Client,
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to `url`, overriding password and db when given.
    pub async fn connect(url: &str, password: Option<&str>, db: i64) -> KvResult<Self> {
        let mut info = url.into_connection_info().map_err(map_redis_err)?;
        if let Some(password) = password {
            info.redis.password = Some(password.to_string());
        }
        if db != 0 {
            info.redis.db = db;
        }
        let client = Client::open(info).map_err(map_redis_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(map_redis_err)?;
        debug!(%url, db, "redis kv connected");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn push_op(pipe: &mut redis::Pipeline, op: &KvOp) {
    match op {
        KvOp::Set {
            key,
            value,
            ttl_secs,
        } => {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl_secs {
                cmd.arg("EX").arg(*ttl);
            }
        }
        KvOp::Del { key } => {
            pipe.cmd("DEL").arg(key);
        }
        KvOp::Expire { key, ttl_secs } => {
            pipe.cmd("EXPIRE").arg(key).arg(*ttl_secs);
        }
        KvOp::HSet { key, field, value } => {
            pipe.cmd("HSET").arg(key).arg(field).arg(value);
        }
        KvOp::HMSet { key, pairs } => {
            let cmd = pipe.cmd("HSET").arg(key);
            for (field, value) in pairs {
                cmd.arg(field).arg(value);
            }
        }
        KvOp::HDel { key, fields } => {
            pipe.cmd("HDEL").arg(key).arg(fields);
        }
        KvOp::ZAdd { key, members } => {
            let cmd = pipe.cmd("ZADD").arg(key);
            for (member, score) in members {
                cmd.arg(*score).arg(member);
            }
        }
        KvOp::ZRemRangeByScore { key, min, max } => {
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(*min))
                .arg(score_arg(*max));
        }
        KvOp::ZRemRangeByRank { key, start, stop } => {
            pipe.cmd("ZREMRANGEBYRANK").arg(key).arg(*start).arg(*stop);
        }
    }
}

/// Redis spells infinite scores as `-inf` / `+inf`.
fn score_arg(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if score == f64::INFINITY {
        "+inf".to_string()
    } else {
        score.to_string()
    }
}

/// Skip empty writes: Redis rejects `HSET key` / `ZADD key` with no pairs.
fn is_noop(op: &KvOp) -> bool {
    match op {
        KvOp::HMSet { pairs, .. } => pairs.is_empty(),
        KvOp::HDel { fields, .. } => fields.is_empty(),
        KvOp::ZAdd { members, .. } => members.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl KvClient for RedisKv {
    async fn ping(&self) -> KvResult<()> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        let _: () = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<u64> {
        let n: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(n)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<bool> {
        let set: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(set)
    }

    async fn expire_nx(&self, key: &str, ttl_secs: u64) -> KvResult<bool> {
        let set: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .arg("NX")
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(set)
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<i64>> {
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        // -2: no such key, -1: no expiry
        Ok((ttl >= 0).then_some(ttl))
    }

    async fn decr_by(&self, key: &str, n: i64) -> KvResult<i64> {
        let value: i64 = redis::cmd("DECRBY")
            .arg(key)
            .arg(n)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(value)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<u64> {
        let added: u64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(added)
    }

    async fn hmset(&self, key: &str, pairs: &[(String, String)]) -> KvResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in pairs {
            cmd.arg(field).arg(value);
        }
        let _: u64 = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> KvResult<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(values)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> KvResult<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let n: u64 = redis::cmd("HDEL")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(n)
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(map)
    }

    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> KvResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (member, score) in members {
            cmd.arg(*score).arg(member);
        }
        let n: u64 = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(n)
    }

    async fn zrem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let n: u64 = redis::cmd("ZREM")
            .arg(key)
            .arg(members)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(n)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        let n: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(n)
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> KvResult<u64> {
        let n: u64 = redis::cmd("ZREMRANGEBYRANK")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(n)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> KvResult<Vec<(String, f64)>> {
        let members: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(members)
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        let n: u64 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(n)
    }

    async fn scan_match(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<u64> {
        let n: u64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        Ok(n)
    }

    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(map_redis_err)?;
        pubsub.subscribe(channel).await.map_err(map_redis_err)?;
        let (tx, rx) = mpsc::channel(SUBSCRIBE_CAPACITY);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(%channel, error = %e, "undecodable pubsub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(%channel, "subscription closed");
        });
        Ok(rx)
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> KvResult<Vec<i64>> {
        let mut pipe = redis::pipe();
        let mut slots = Vec::with_capacity(ops.len());
        for op in &ops {
            if is_noop(op) {
                slots.push(false);
            } else {
                push_op(&mut pipe, op);
                slots.push(true);
            }
        }
        if !slots.iter().any(|s| *s) {
            return Ok(vec![0; ops.len()]);
        }
        let values: Vec<redis::Value> = pipe
            .query_async(&mut self.conn())
            .await
            .map_err(map_redis_err)?;
        let mut values = values.into_iter();
        Ok(slots
            .into_iter()
            .map(|sent| {
                if !sent {
                    return 0;
                }
                match values.next() {
                    Some(redis::Value::Int(n)) => n,
                    Some(redis::Value::Okay) => 1,
                    _ => 0,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_scores_use_redis_spelling() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(12.0), "12");
    }

    #[test]
    fn empty_writes_are_skipped() {
        assert!(is_noop(&KvOp::ZAdd {
            key: "z".into(),
            members: vec![]
        }));
        assert!(!is_noop(&KvOp::Del { key: "z".into() }));
    }

    #[test]
    fn pipeline_encodes_hmset_as_hset() {
        let mut pipe = redis::pipe();
        push_op(
            &mut pipe,
            &KvOp::HMSet {
                key: "h".into(),
                pairs: vec![("a".into(), "1".into())],
            },
        );
        let packed = String::from_utf8_lossy(&pipe.get_packed_pipeline()).to_string();
        assert!(packed.contains("HSET"));
        assert!(packed.contains("\r\na\r\n"));
    }
}
