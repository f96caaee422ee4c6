//! Process configuration.
//!
//! Built from defaults, then an optional TOML file, then environment
//! variables. Later layers win.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    pub kv: KvSettings,
    pub listen_addr: String,
    pub inbound_topic: String,
    pub outbound_topic: String,
    pub assign_topic: String,
    pub worker_count: usize,
    pub batch_size: usize,
    pub check_result: CheckResultSettings,
    pub token: TokenSettings,
    pub access: AccessSettings,
    pub double_check: DoubleCheckSettings,
    pub strategy_refresh_secs: u64,
    pub subscribe_refresh_secs: u64,
    pub shutdown_grace_secs: u64,
    /// JSON file of strategies; when unset strategies are read from KV.
    pub strategy_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvSettings {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
    pub timeout_ms: u64,
    /// How long the backend may stay unreachable before workers give up.
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckResultSettings {
    pub max_points: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    pub capacity: i64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSettings {
    pub max_time_points: usize,
    pub expire_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DoubleCheckSettings {
    /// Strategies the missing-points SUM check applies to.
    pub sum_strategy_ids: Vec<u64>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            kv: KvSettings::default(),
            listen_addr: "0.0.0.0:8090".to_string(),
            inbound_topic: "access-data".to_string(),
            outbound_topic: "alert-event".to_string(),
            assign_topic: "alert-assign".to_string(),
            worker_count: 4,
            batch_size: 500,
            check_result: CheckResultSettings::default(),
            token: TokenSettings::default(),
            access: AccessSettings::default(),
            double_check: DoubleCheckSettings::default(),
            strategy_refresh_secs: 60,
            subscribe_refresh_secs: 60,
            shutdown_grace_secs: 10,
            strategy_file: None,
        }
    }
}

impl Default for KvSettings {
    fn default() -> Self {
        Self {
            addr: "memory://".to_string(),
            password: None,
            db: 0,
            timeout_ms: 2000,
            grace_secs: 60,
        }
    }
}

impl Default for CheckResultSettings {
    fn default() -> Self {
        Self {
            max_points: 30,
            ttl_secs: 3600,
        }
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            capacity: 600,
            window_secs: 600,
        }
    }
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            max_time_points: 60,
            expire_secs: 86_400,
        }
    }
}

/// Which KV implementation `kv.addr` selects.
#[derive(Debug, Clone, PartialEq)]
pub enum KvBackend {
    /// In-process store: `memory://`
    Memory,
    /// Redis: `redis://host:port` or `rediss://...`
    Redis { url: String },
}

impl KvSettings {
    pub fn backend(&self) -> ConfigResult<KvBackend> {
        let addr = self.addr.trim();
        if addr == "memory://" || addr == "memory" {
            Ok(KvBackend::Memory)
        } else if addr.starts_with("redis://") || addr.starts_with("rediss://") {
            Ok(KvBackend::Redis {
                url: addr.to_string(),
            })
        } else {
            Err(ConfigError::Invalid {
                key: "KV_ADDR".to_string(),
                value: self.addr.clone(),
            })
        }
    }
}

impl AlarmConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KEY=value` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KV_ADDR") {
            self.kv.addr = v;
        }
        if let Some(v) = lookup("KV_PASSWORD") {
            self.kv.password = (!v.is_empty()).then_some(v);
        }
        override_parsed(&lookup, "KV_DB", &mut self.kv.db)?;
        override_parsed(&lookup, "KV_TIMEOUT_MS", &mut self.kv.timeout_ms)?;
        override_parsed(&lookup, "KV_GRACE_SECONDS", &mut self.kv.grace_secs)?;
        if let Some(v) = lookup("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("INBOUND_TOPIC") {
            self.inbound_topic = v;
        }
        if let Some(v) = lookup("OUTBOUND_TOPIC") {
            self.outbound_topic = v;
        }
        if let Some(v) = lookup("ASSIGN_TOPIC") {
            self.assign_topic = v;
        }
        override_parsed(&lookup, "WORKER_COUNT", &mut self.worker_count)?;
        override_parsed(&lookup, "BATCH_SIZE", &mut self.batch_size)?;
        override_parsed(
            &lookup,
            "CHECK_RESULT_MAX_POINTS",
            &mut self.check_result.max_points,
        )?;
        override_parsed(
            &lookup,
            "CHECK_RESULT_TTL_SECONDS",
            &mut self.check_result.ttl_secs,
        )?;
        override_parsed(&lookup, "TOKEN_DEFAULT_CAPACITY", &mut self.token.capacity)?;
        override_parsed(&lookup, "TOKEN_WINDOW_SECONDS", &mut self.token.window_secs)?;
        override_parsed(
            &lookup,
            "STRATEGY_REFRESH_SECONDS",
            &mut self.strategy_refresh_secs,
        )?;
        override_parsed(
            &lookup,
            "SUBSCRIBE_REFRESH_SECONDS",
            &mut self.subscribe_refresh_secs,
        )?;
        override_parsed(
            &lookup,
            "SHUTDOWN_GRACE_SECONDS",
            &mut self.shutdown_grace_secs,
        )?;
        override_parsed(
            &lookup,
            "ACCESS_MAX_TIME_POINTS",
            &mut self.access.max_time_points,
        )?;
        override_parsed(&lookup, "ACCESS_EXPIRE_SECONDS", &mut self.access.expire_secs)?;
        if let Some(v) = lookup("DOUBLE_CHECK_SUM_STRATEGY_IDS") {
            self.double_check.sum_strategy_ids = parse_id_list("DOUBLE_CHECK_SUM_STRATEGY_IDS", &v)?;
        }
        if let Some(v) = lookup("STRATEGY_FILE") {
            self.strategy_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.kv.backend()?;
        let checks: [(&str, bool, String); 5] = [
            ("WORKER_COUNT", self.worker_count > 0, self.worker_count.to_string()),
            ("BATCH_SIZE", self.batch_size > 0, self.batch_size.to_string()),
            (
                "CHECK_RESULT_MAX_POINTS",
                self.check_result.max_points > 0,
                self.check_result.max_points.to_string(),
            ),
            (
                "TOKEN_WINDOW_SECONDS",
                self.token.window_secs > 0,
                self.token.window_secs.to_string(),
            ),
            (
                "TOKEN_DEFAULT_CAPACITY",
                self.token.capacity > 0,
                self.token.capacity.to_string(),
            ),
        ];
        for (key, ok, value) in checks {
            if !ok {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn parse_id_list(key: &str, raw: &str) -> ConfigResult<Vec<u64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = AlarmConfig::default();
        assert_eq!(config.check_result.max_points, 30);
        assert_eq!(config.token.capacity, 600);
        assert_eq!(config.outbound_topic, "alert-event");
        assert_eq!(config.kv.backend().unwrap(), KvBackend::Memory);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("KV_ADDR", "redis://127.0.0.1:6379"),
            ("KV_DB", "3"),
            ("WORKER_COUNT", "8"),
            ("CHECK_RESULT_MAX_POINTS", "3"),
            ("DOUBLE_CHECK_SUM_STRATEGY_IDS", "42, 43"),
        ]);
        let mut config = AlarmConfig::default();
        config.apply_overrides(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.kv.db, 3);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.check_result.max_points, 3);
        assert_eq!(config.double_check.sum_strategy_ids, vec![42, 43]);
        assert_eq!(
            config.kv.backend().unwrap(),
            KvBackend::Redis {
                url: "redis://127.0.0.1:6379".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_env_value() {
        let vars = env(&[("BATCH_SIZE", "lots")]);
        let mut config = AlarmConfig::default();
        let err = config.apply_overrides(|k| vars.get(k).cloned()).unwrap_err();
        match err {
            ConfigError::Invalid { key, value } => {
                assert_eq!(key, "BATCH_SIZE");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = AlarmConfig {
            worker_count: 0,
            ..AlarmConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref key, .. }) if key == "WORKER_COUNT"
        ));
    }

    #[test]
    fn test_unknown_kv_scheme() {
        let mut config = AlarmConfig::default();
        config.kv.addr = "etcd://x".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
worker_count = 2

[check_result]
max_points = 10

[token]
capacity = 50
"#
        )
        .unwrap();

        let mut config = AlarmConfig::from_file(file.path()).unwrap();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.check_result.max_points, 10);
        assert_eq!(config.check_result.ttl_secs, 3600);
        assert_eq!(config.token.capacity, 50);

        let vars = env(&[("TOKEN_DEFAULT_CAPACITY", "70")]);
        config.apply_overrides(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.token.capacity, 70);
    }

    #[test]
    fn test_missing_file() {
        let err = AlarmConfig::from_file(Path::new("/nonexistent/alarm.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
