pub mod cache_router;
pub mod check_results;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use alarm_core::{AlarmConfig, ConfigError, KvBackend};
use alarm_kv::{KvClient, KvError, KvRoute, RedisConnector, RetryPolicy, RoutedNodes, SharedKv, SingleNode};
use anyhow::Context;
use thiserror::Error;

pub const EXIT_OK: u8 = 0;
pub const EXIT_USER: u8 = 1;
pub const EXIT_UNAVAILABLE: u8 = 2;

/// Operator mistakes that are not backend failures.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("unknown node {0}; pass --addr to register it")]
    UnknownNode(String),
    #[error("{0}")]
    Invalid(String),
}

/// Exit code for a failed command: 2 when the KV backend could not be
/// reached, 1 for everything the operator can fix.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(kv) = cause.downcast_ref::<KvError>() {
            return if kv.is_connectivity() {
                EXIT_UNAVAILABLE
            } else {
                EXIT_USER
            };
        }
        if cause.is::<ConfigError>() || cause.is::<UsageError>() {
            return EXIT_USER;
        }
    }
    EXIT_USER
}

/// Connected KV clients for one invocation.
pub struct Backend {
    pub kv: SharedKv,
    pub route: Arc<dyn KvRoute>,
}

impl Backend {
    pub fn single(kv: SharedKv) -> Self {
        Self {
            route: Arc::new(SingleNode(kv.clone())),
            kv,
        }
    }
}

pub async fn open(config: &AlarmConfig) -> anyhow::Result<Backend> {
    let backend = config.kv.backend()?;
    let kv = alarm_kv::connect(&config.kv)
        .await
        .with_context(|| format!("connecting to {}", config.kv.addr))?;
    kv.ping().await.context("kv ping")?;
    match backend {
        KvBackend::Memory => Ok(Backend::single(kv)),
        KvBackend::Redis { .. } => {
            let routes = Arc::new(RoutedNodes::new(kv.clone()));
            let connector = RedisConnector {
                policy: RetryPolicy::new(
                    Duration::from_millis(config.kv.timeout_ms),
                    Duration::from_secs(config.kv.grace_secs),
                ),
            };
            routes.reload(&connector).await.context("loading cache router")?;
            Ok(Backend { kv, route: routes })
        }
    }
}
