//! alarm-kv — shared key-value store access for the alarm pipeline.
//!
//! # Architecture
//!
//! Every stage reaches the store through the [`KvClient`] trait. Two
//! backends implement it: [`RedisKv`] for production and [`MemoryKv`]
//! for tests and single-process runs. [`RetryingKv`] wraps either one
//! with per-call deadlines, bounded retries and outage detection.
//!
//! ```text
//!  stage ──► Arc<dyn KvClient> ──► RetryingKv ──► RedisKv | MemoryKv
//!                  ▲
//!     KvRoute::client_for(strategy_id)   (CacheRouter: id → node)
//! ```
//!
//! All key names come from [`keys`].

pub mod client;
pub mod error;
pub mod keys;
pub mod memory;
pub mod redis_store;
pub mod retry;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use alarm_core::config::KvSettings;
use alarm_core::KvBackend;
use async_trait::async_trait;

pub use client::{KvClient, KvOp, SharedKv};
pub use error::{KvError, KvResult};
pub use memory::MemoryKv;
pub use redis_store::RedisKv;
pub use retry::{RetryPolicy, RetryingKv};
pub use router::{CacheNode, CacheRouter, KvRoute, NodeConnector, RoutedNodes, SingleNode};

/// Open the backend selected by `settings`, wrapped in the retry layer.
pub async fn connect(settings: &KvSettings) -> KvResult<SharedKv> {
    let policy = RetryPolicy::new(
        Duration::from_millis(settings.timeout_ms),
        Duration::from_secs(settings.grace_secs),
    );
    let backend = settings
        .backend()
        .map_err(|e| KvError::Invalid(e.to_string()))?;
    let client: SharedKv = match backend {
        KvBackend::Memory => Arc::new(RetryingKv::new(MemoryKv::new(), policy)),
        KvBackend::Redis { url } => {
            let redis = RedisKv::connect(&url, settings.password.as_deref(), settings.db).await?;
            Arc::new(RetryingKv::new(redis, policy))
        }
    };
    Ok(client)
}

/// Connects routed nodes over Redis with the same retry policy as the
/// default node.
pub struct RedisConnector {
    pub policy: RetryPolicy,
}

#[async_trait]
impl NodeConnector for RedisConnector {
    async fn connect(&self, alias: &str, node: &CacheNode) -> KvResult<SharedKv> {
        let redis = RedisKv::connect(&node.addr, node.password.as_deref(), node.db).await?;
        tracing::info!(%alias, addr = %node.addr, "connected routed kv node");
        Ok(Arc::new(RetryingKv::new(redis, self.policy.clone())))
    }
}
