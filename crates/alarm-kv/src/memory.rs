//! In-process `KvClient`.
//!
//! Used by tests and by single-node development runs (`KV_ADDR=memory://`).
//! Expiry is evaluated against the injected clock, so a `ManualClock`
//! gives fully deterministic TTL behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use alarm_core::{SharedClock, SystemClock};
use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::client::KvClient;
use crate::error::{KvError, KvResult};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

struct Inner {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    clock: SharedClock,
    pending_faults: AtomicU32,
    down: AtomicBool,
}

/// Thread-safe in-memory store. Clones share the same data.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        debug!("in-memory kv opened");
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                clock,
                pending_faults: AtomicU32::new(0),
                down: AtomicBool::new(false),
            }),
        }
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn inject_transient_faults(&self, n: u32) {
        self.inner.pending_faults.store(n, Ordering::SeqCst);
    }

    /// While down, every call fails with a transient error.
    pub fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.inner.clock.now();
        let data = self.inner.data.lock().expect("kv lock");
        data.values().filter(|e| is_live(e, now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_faults(&self) -> KvResult<()> {
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(KvError::Transient("connection refused".to_string()));
        }
        let taken = self
            .inner
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() {
            return Err(KvError::Transient("injected fault".to_string()));
        }
        Ok(())
    }

    /// Run `f` over the keyspace with expired entries already purged.
    fn with_data<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>, f64) -> KvResult<T>,
    ) -> KvResult<T> {
        self.check_faults()?;
        let now = self.inner.clock.now();
        let mut data = self.inner.data.lock().expect("kv lock");
        data.retain(|_, e| is_live(e, now));
        f(&mut data, now)
    }
}

fn is_live(entry: &Entry, now: f64) -> bool {
    entry.expires_at.is_none_or(|at| at > now)
}

fn wrong_type(key: &str) -> KvError {
    KvError::Protocol(format!(
        "WRONGTYPE operation against a key holding the wrong kind of value: {key}"
    ))
}

fn hash_mut<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
) -> KvResult<&'a mut HashMap<String, String>> {
    let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Hash(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Hash(h) => Ok(h),
        _ => Err(wrong_type(key)),
    }
}

fn zset_mut<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
) -> KvResult<&'a mut HashMap<String, f64>> {
    let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::ZSet(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::ZSet(z) => Ok(z),
        _ => Err(wrong_type(key)),
    }
}

fn hash_ref<'a>(
    data: &'a HashMap<String, Entry>,
    key: &str,
) -> KvResult<Option<&'a HashMap<String, String>>> {
    match data.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::Hash(h)) => Ok(Some(h)),
        Some(_) => Err(wrong_type(key)),
    }
}

fn zset_ref<'a>(
    data: &'a HashMap<String, Entry>,
    key: &str,
) -> KvResult<Option<&'a HashMap<String, f64>>> {
    match data.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::ZSet(z)) => Ok(Some(z)),
        Some(_) => Err(wrong_type(key)),
    }
}

/// Members ordered by (score, member), as Redis orders them.
fn sorted_members(z: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = z.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

/// Normalize a Redis `[start, stop]` rank range against `len`.
fn rank_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Drop the key if a hash or zset became empty.
fn drop_if_empty(data: &mut HashMap<String, Entry>, key: &str) {
    let empty = match data.get(key).map(|e| &e.value) {
        Some(Value::Hash(h)) => h.is_empty(),
        Some(Value::ZSet(z)) => z.is_empty(),
        _ => false,
    };
    if empty {
        data.remove(key);
    }
}

fn glob_to_regex(pattern: &str) -> KvResult<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| KvError::Invalid(e.to_string()))
}

#[async_trait]
impl KvClient for MemoryKv {
    async fn ping(&self) -> KvResult<()> {
        self.check_faults()
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.with_data(|data, _| match data.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> KvResult<()> {
        self.with_data(|data, now| {
            data.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: ttl_secs.map(|t| now + t as f64),
                },
            );
            Ok(())
        })
    }

    async fn del(&self, key: &str) -> KvResult<u64> {
        self.with_data(|data, _| Ok(data.remove(key).map_or(0, |_| 1)))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> KvResult<bool> {
        self.with_data(|data, now| match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl_secs as f64);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn expire_nx(&self, key: &str, ttl_secs: u64) -> KvResult<bool> {
        self.with_data(|data, now| match data.get_mut(key) {
            Some(entry) if entry.expires_at.is_none() => {
                entry.expires_at = Some(now + ttl_secs as f64);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<i64>> {
        self.with_data(|data, now| {
            Ok(data
                .get(key)
                .and_then(|e| e.expires_at)
                .map(|at| (at - now).ceil() as i64))
        })
    }

    async fn decr_by(&self, key: &str, n: i64) -> KvResult<i64> {
        self.with_data(|data, _| {
            let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Str("0".to_string()),
                expires_at: None,
            });
            let Value::Str(s) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let current: i64 = s.parse().map_err(|_| {
                KvError::Protocol(format!("value is not an integer: {key}"))
            })?;
            let next = current - n;
            *s = next.to_string();
            Ok(next)
        })
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.with_data(|data, _| Ok(hash_ref(data, key)?.and_then(|h| h.get(field).cloned())))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<u64> {
        self.with_data(|data, _| {
            let h = hash_mut(data, key)?;
            Ok(h.insert(field.to_string(), value.to_string()).map_or(1, |_| 0))
        })
    }

    async fn hmset(&self, key: &str, pairs: &[(String, String)]) -> KvResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        self.with_data(|data, _| {
            let h = hash_mut(data, key)?;
            for (field, value) in pairs {
                h.insert(field.clone(), value.clone());
            }
            Ok(())
        })
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> KvResult<Vec<Option<String>>> {
        self.with_data(|data, _| {
            let h = hash_ref(data, key)?;
            Ok(fields
                .iter()
                .map(|f| h.and_then(|h| h.get(f).cloned()))
                .collect())
        })
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> KvResult<u64> {
        self.with_data(|data, _| {
            if hash_ref(data, key)?.is_none() {
                return Ok(0);
            }
            let h = hash_mut(data, key)?;
            let removed = fields.iter().filter(|f| h.remove(*f).is_some()).count() as u64;
            drop_if_empty(data, key);
            Ok(removed)
        })
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        self.with_data(|data, _| Ok(hash_ref(data, key)?.cloned().unwrap_or_default()))
    }

    async fn zadd(&self, key: &str, members: &[(String, f64)]) -> KvResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        self.with_data(|data, _| {
            let z = zset_mut(data, key)?;
            let mut inserted = 0;
            for (member, score) in members {
                if z.insert(member.clone(), *score).is_none() {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    async fn zrem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        self.with_data(|data, _| {
            if zset_ref(data, key)?.is_none() {
                return Ok(0);
            }
            let z = zset_mut(data, key)?;
            let removed = members.iter().filter(|m| z.remove(*m).is_some()).count() as u64;
            drop_if_empty(data, key);
            Ok(removed)
        })
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        self.with_data(|data, _| {
            if zset_ref(data, key)?.is_none() {
                return Ok(0);
            }
            let z = zset_mut(data, key)?;
            let before = z.len();
            z.retain(|_, score| *score < min || *score > max);
            let removed = (before - z.len()) as u64;
            drop_if_empty(data, key);
            Ok(removed)
        })
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> KvResult<u64> {
        self.with_data(|data, _| {
            let Some(z) = zset_ref(data, key)? else {
                return Ok(0);
            };
            let sorted = sorted_members(z);
            let Some((from, to)) = rank_range(sorted.len(), start, stop) else {
                return Ok(0);
            };
            let z = zset_mut(data, key)?;
            for (member, _) in &sorted[from..=to] {
                z.remove(member);
            }
            drop_if_empty(data, key);
            Ok((to - from + 1) as u64)
        })
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> KvResult<Vec<(String, f64)>> {
        self.with_data(|data, _| {
            let Some(z) = zset_ref(data, key)? else {
                return Ok(Vec::new());
            };
            let sorted = sorted_members(z);
            Ok(match rank_range(sorted.len(), start, stop) {
                Some((from, to)) => sorted[from..=to].to_vec(),
                None => Vec::new(),
            })
        })
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        self.with_data(|data, _| Ok(zset_ref(data, key)?.map_or(0, |z| z.len() as u64)))
    }

    async fn scan_match(&self, pattern: &str) -> KvResult<Vec<String>> {
        let re = glob_to_regex(pattern)?;
        self.with_data(|data, _| {
            let mut keys: Vec<String> = data.keys().filter(|k| re.is_match(k)).cloned().collect();
            keys.sort();
            Ok(keys)
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<u64> {
        self.check_faults()?;
        let channels = self.inner.channels.lock().expect("channels lock");
        Ok(channels
            .get(channel)
            .and_then(|tx| tx.send(payload.to_string()).ok())
            .unwrap_or(0) as u64)
    }

    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::Receiver<String>> {
        self.check_faults()?;
        let mut rx = {
            let mut channels = self.inner.channels.lock().expect("channels lock");
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let (tx, out) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::KvOp;
    use alarm_core::ManualClock;

    fn clocked() -> (MemoryKv, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1000.0));
        (MemoryKv::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn set_get_with_ttl() {
        let (kv, clock) = clocked();
        kv.set("k", "v", Some(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(kv.ttl("k").await.unwrap(), Some(60));

        clock.advance(30.0);
        assert_eq!(kv.ttl("k").await.unwrap(), Some(30));

        clock.advance(31.0);
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_without_ttl_has_no_expiry() {
        let (kv, _) = clocked();
        kv.set("k", "1", None).await.unwrap();
        assert_eq!(kv.ttl("k").await.unwrap(), None);
        assert!(kv.expire("k", 10).await.unwrap());
        assert_eq!(kv.ttl("k").await.unwrap(), Some(10));
        assert!(!kv.expire("missing", 10).await.unwrap());
    }

    #[tokio::test]
    async fn expire_nx_only_sets_a_missing_lifetime() {
        let (kv, _) = clocked();
        kv.set("k", "1", None).await.unwrap();
        assert!(kv.expire_nx("k", 10).await.unwrap());
        assert!(!kv.expire_nx("k", 99).await.unwrap());
        assert_eq!(kv.ttl("k").await.unwrap(), Some(10));
        assert!(!kv.expire_nx("missing", 10).await.unwrap());
    }

    #[tokio::test]
    async fn decr_by_counts_down_and_keeps_ttl() {
        let (kv, _) = clocked();
        kv.set("t", "2", Some(60)).await.unwrap();
        assert_eq!(kv.decr_by("t", 1).await.unwrap(), 1);
        assert_eq!(kv.decr_by("t", 1).await.unwrap(), 0);
        assert_eq!(kv.decr_by("t", 1).await.unwrap(), -1);
        assert_eq!(kv.ttl("t").await.unwrap(), Some(60));
        assert_eq!(kv.decr_by("fresh", 3).await.unwrap(), -3);
    }

    #[tokio::test]
    async fn hash_ops() {
        let (kv, _) = clocked();
        assert_eq!(kv.hset("h", "a", "1").await.unwrap(), 1);
        assert_eq!(kv.hset("h", "a", "2").await.unwrap(), 0);
        kv.hmset("h", &[("b".into(), "3".into()), ("c".into(), "4".into())])
            .await
            .unwrap();
        assert_eq!(kv.hget("h", "a").await.unwrap().as_deref(), Some("2"));
        let got = kv
            .hmget("h", &["a".into(), "zz".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some("2".into()), None, Some("4".into())]);
        assert_eq!(kv.hdel("h", &["a".into(), "nope".into()]).await.unwrap(), 1);
        assert_eq!(kv.hgetall("h").await.unwrap().len(), 2);
        kv.hdel("h", &["b".into(), "c".into()]).await.unwrap();
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn wrong_type_is_protocol_error() {
        let (kv, _) = clocked();
        kv.set("s", "x", None).await.unwrap();
        let err = kv.hget("s", "f").await.unwrap_err();
        assert!(matches!(err, KvError::Protocol(_)));
    }

    #[tokio::test]
    async fn zset_trim_by_rank_keeps_newest() {
        let (kv, _) = clocked();
        for ts in 1..=5 {
            let inserted = kv
                .zadd("z", &[(format!("{ts}|ANOMALY"), ts as f64)])
                .await
                .unwrap();
            assert_eq!(inserted, 1);
        }
        assert_eq!(kv.zadd("z", &[("5|ANOMALY".into(), 5.0)]).await.unwrap(), 0);

        let removed = kv.zremrangebyrank("z", 0, -4).await.unwrap();
        assert_eq!(removed, 2);
        let members: Vec<String> = kv
            .zrange_withscores("z", 0, -1)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["3|ANOMALY", "4|ANOMALY", "5|ANOMALY"]);
        assert_eq!(kv.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn zset_trim_by_score_is_inclusive() {
        let (kv, _) = clocked();
        kv.zadd(
            "z",
            &[("a".into(), 1.0), ("b".into(), 2.0), ("c".into(), 3.0)],
        )
        .await
        .unwrap();
        assert_eq!(kv.zremrangebyscore("z", f64::NEG_INFINITY, 2.0).await.unwrap(), 2);
        assert_eq!(kv.zrem("z", &["c".into()]).await.unwrap(), 1);
        assert_eq!(kv.zcard("z").await.unwrap(), 0);
    }

    #[test]
    fn rank_range_matches_redis() {
        assert_eq!(rank_range(5, 0, -1), Some((0, 4)));
        assert_eq!(rank_range(5, 0, -4), Some((0, 1)));
        assert_eq!(rank_range(3, 0, -4), None);
        assert_eq!(rank_range(0, 0, -1), None);
        assert_eq!(rank_range(5, -2, -1), Some((3, 4)));
        assert_eq!(rank_range(5, 2, 100), Some((2, 4)));
    }

    #[tokio::test]
    async fn scan_uses_glob() {
        let (kv, _) = clocked();
        kv.set("bkmonitor.TOKEN.a", "1", None).await.unwrap();
        kv.set("bkmonitor.TOKEN.b", "1", None).await.unwrap();
        kv.set("bkmonitor.OTHER", "1", None).await.unwrap();
        let keys = kv.scan_match("bkmonitor.TOKEN.*").await.unwrap();
        assert_eq!(keys, vec!["bkmonitor.TOKEN.a", "bkmonitor.TOKEN.b"]);
    }

    #[tokio::test]
    async fn pipeline_runs_in_order() {
        let (kv, _) = clocked();
        let results = kv
            .pipeline(vec![
                KvOp::HSet {
                    key: "h".into(),
                    field: "f".into(),
                    value: "v".into(),
                },
                KvOp::Expire {
                    key: "h".into(),
                    ttl_secs: 30,
                },
                KvOp::Del { key: "gone".into() },
            ])
            .await
            .unwrap();
        assert_eq!(results, vec![1, 1, 0]);
        assert_eq!(kv.ttl("h").await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn pubsub_delivers() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe("alert-event").await.unwrap();
        assert_eq!(kv.publish("alert-event", "hello").await.unwrap(), 1);
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(kv.publish("nobody", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_faults_are_transient() {
        let kv = MemoryKv::new();
        kv.inject_transient_faults(1);
        assert!(kv.ping().await.unwrap_err().is_retryable());
        kv.ping().await.unwrap();
        kv.set_down(true);
        assert!(kv.get("x").await.is_err());
        kv.set_down(false);
        assert_eq!(kv.get("x").await.unwrap(), None);
    }
}
