//! Strategy-id → KV node routing.
//!
//! Check results for large installations are spread over several Redis
//! nodes. The route table lives in KV itself:
//!
//! ```text
//! bkmonitor.CACHE_ROUTER   hash  score      -> node alias
//! bkmonitor.CACHE_NODE     hash  node alias -> {"addr", "password", "db"}
//!
//!   0 ─────── 1000 ─────── 5000 ─────── ∞
//!     default      node-a      default
//! ```
//!
//! A strategy id is served by the route with the smallest score strictly
//! greater than the id; ids past the last score use the default node.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{KvClient, KvOp, SharedKv};
use crate::error::{KvError, KvResult};
use crate::keys;

/// Alias of the node configured through `KV_ADDR`.
pub const DEFAULT_NODE: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheNode {
    pub addr: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
}

/// `[floor, ceil)` served by `node`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteInterval {
    pub floor: u64,
    pub ceil: u64,
    pub node: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheRouter {
    /// Exclusive upper bound → node alias.
    routes: BTreeMap<u64, String>,
}

impl CacheRouter {
    pub fn from_hash(raw: &HashMap<String, String>) -> KvResult<Self> {
        let mut routes = BTreeMap::new();
        for (score, node) in raw {
            let score: u64 = score
                .parse()
                .map_err(|_| KvError::Deserialize(format!("bad router score: {score}")))?;
            routes.insert(score, node.clone());
        }
        Ok(Self { routes })
    }

    pub fn to_hash(&self) -> Vec<(String, String)> {
        self.routes
            .iter()
            .map(|(score, node)| (score.to_string(), node.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Node alias serving `strategy_id`.
    pub fn route(&self, strategy_id: u64) -> &str {
        self.routes
            .range((Excluded(strategy_id), Unbounded))
            .next()
            .map(|(_, node)| node.as_str())
            .unwrap_or(DEFAULT_NODE)
    }

    pub fn intervals(&self) -> Vec<RouteInterval> {
        let mut floor = 0;
        self.routes
            .iter()
            .map(|(ceil, node)| {
                let interval = RouteInterval {
                    floor,
                    ceil: *ceil,
                    node: node.clone(),
                };
                floor = *ceil;
                interval
            })
            .collect()
    }

    /// Point `[floor, ceil)` at `node`, splitting whatever covered it.
    pub fn add(&mut self, node: &str, floor: u64, ceil: u64) -> KvResult<()> {
        if floor >= ceil {
            return Err(KvError::Invalid(format!(
                "empty range: floor {floor} >= ceil {ceil}"
            )));
        }
        if node.is_empty() {
            return Err(KvError::Invalid("empty node alias".to_string()));
        }
        let below = (floor > 0).then(|| self.route(floor - 1).to_string());
        let covered: Vec<u64> = self
            .routes
            .range((Excluded(floor), Excluded(ceil)))
            .map(|(k, _)| *k)
            .collect();
        for k in covered {
            self.routes.remove(&k);
        }
        if let Some(below) = below {
            self.routes.insert(floor, below);
        }
        self.routes.insert(ceil, node.to_string());
        self.optimize();
        Ok(())
    }

    /// Drop every interval of `node`; each one falls to the next interval.
    pub fn remove_node(&mut self, node: &str) -> KvResult<usize> {
        let before = self.routes.len();
        self.routes.retain(|_, n| n != node);
        let removed = before - self.routes.len();
        if removed == 0 {
            return Err(KvError::NotFound(format!("node {node} has no routes")));
        }
        self.optimize();
        Ok(removed)
    }

    /// Merge adjacent intervals on the same node and drop trailing
    /// default intervals, which routing already implies.
    pub fn optimize(&mut self) {
        let keys: Vec<u64> = self.routes.keys().copied().collect();
        for pair in keys.windows(2) {
            if self.routes.get(&pair[0]) == self.routes.get(&pair[1]) {
                self.routes.remove(&pair[0]);
            }
        }
        while let Some(entry) = self.routes.last_entry() {
            if entry.get() == DEFAULT_NODE {
                entry.remove();
            } else {
                break;
            }
        }
    }

    pub async fn load(kv: &dyn KvClient) -> KvResult<Self> {
        let raw = kv.hgetall(keys::CACHE_ROUTER).await?;
        Self::from_hash(&raw)
    }

    pub async fn save(&self, kv: &dyn KvClient) -> KvResult<()> {
        kv.pipeline(vec![
            KvOp::Del {
                key: keys::CACHE_ROUTER.to_string(),
            },
            KvOp::HMSet {
                key: keys::CACHE_ROUTER.to_string(),
                pairs: self.to_hash(),
            },
        ])
        .await?;
        debug!(routes = self.routes.len(), "cache router saved");
        Ok(())
    }
}

pub async fn load_nodes(kv: &dyn KvClient) -> KvResult<HashMap<String, CacheNode>> {
    let raw = kv.hgetall(keys::CACHE_NODE).await?;
    let mut nodes = HashMap::with_capacity(raw.len());
    for (alias, json) in raw {
        match serde_json::from_str::<CacheNode>(&json) {
            Ok(node) => {
                nodes.insert(alias, node);
            }
            Err(e) => warn!(%alias, error = %e, "skipping malformed cache node"),
        }
    }
    Ok(nodes)
}

pub async fn save_node(kv: &dyn KvClient, alias: &str, node: &CacheNode) -> KvResult<()> {
    let json = serde_json::to_string(node).map_err(|e| KvError::Serialize(e.to_string()))?;
    kv.hset(keys::CACHE_NODE, alias, &json).await?;
    Ok(())
}

pub async fn delete_node(kv: &dyn KvClient, alias: &str) -> KvResult<bool> {
    Ok(kv.hdel(keys::CACHE_NODE, &[alias.to_string()]).await? > 0)
}

// ── Client resolution ──────────────────────────────────────────

/// Resolves which KV client holds the state of a strategy.
pub trait KvRoute: Send + Sync {
    fn client_for(&self, strategy_id: u64) -> SharedKv;
    fn default_client(&self) -> SharedKv;

    /// Every distinct client, default first. Used by key scans.
    fn all_clients(&self) -> Vec<SharedKv> {
        vec![self.default_client()]
    }
}

/// Everything on one node.
pub struct SingleNode(pub SharedKv);

impl KvRoute for SingleNode {
    fn client_for(&self, _strategy_id: u64) -> SharedKv {
        self.0.clone()
    }

    fn default_client(&self) -> SharedKv {
        self.0.clone()
    }
}

/// Opens a client for a node listed in `CACHE_NODE`.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, alias: &str, node: &CacheNode) -> KvResult<SharedKv>;
}

pub struct RoutedNodes {
    default: SharedKv,
    router: RwLock<CacheRouter>,
    nodes: RwLock<HashMap<String, SharedKv>>,
}

impl RoutedNodes {
    pub fn new(default: SharedKv) -> Self {
        Self {
            default,
            router: RwLock::new(CacheRouter::default()),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn install(&self, router: CacheRouter, nodes: HashMap<String, SharedKv>) {
        *self.router.write().expect("router lock") = router;
        *self.nodes.write().expect("nodes lock") = nodes;
    }

    /// Re-read the route table from the default node and connect to any
    /// node not seen before. Returns the number of routed nodes.
    pub async fn reload(&self, connector: &dyn NodeConnector) -> KvResult<usize> {
        let router = CacheRouter::load(self.default.as_ref()).await?;
        let configured = load_nodes(self.default.as_ref()).await?;
        let known = self.nodes.read().expect("nodes lock").clone();

        let mut nodes = HashMap::new();
        for interval in router.intervals() {
            let alias = interval.node;
            if alias == DEFAULT_NODE || nodes.contains_key(&alias) {
                continue;
            }
            if let Some(client) = known.get(&alias) {
                nodes.insert(alias, client.clone());
                continue;
            }
            let Some(node) = configured.get(&alias) else {
                warn!(%alias, "route points at an unknown node, using default");
                continue;
            };
            let client = connector.connect(&alias, node).await?;
            nodes.insert(alias, client);
        }
        let count = nodes.len();
        self.install(router, nodes);
        info!(nodes = count, "cache router reloaded");
        Ok(count)
    }
}

impl KvRoute for RoutedNodes {
    fn client_for(&self, strategy_id: u64) -> SharedKv {
        let router = self.router.read().expect("router lock");
        let alias = router.route(strategy_id);
        if alias == DEFAULT_NODE {
            return self.default.clone();
        }
        self.nodes
            .read()
            .expect("nodes lock")
            .get(alias)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    fn default_client(&self) -> SharedKv {
        self.default.clone()
    }

    fn all_clients(&self) -> Vec<SharedKv> {
        let nodes = self.nodes.read().expect("nodes lock");
        let mut aliases: Vec<&String> = nodes.keys().collect();
        aliases.sort();
        std::iter::once(self.default.clone())
            .chain(aliases.into_iter().map(|a| nodes[a].clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;

    fn intervals(router: &CacheRouter) -> Vec<(u64, u64, String)> {
        router
            .intervals()
            .into_iter()
            .map(|i| (i.floor, i.ceil, i.node))
            .collect()
    }

    #[test]
    fn empty_router_uses_default() {
        let router = CacheRouter::default();
        assert_eq!(router.route(0), DEFAULT_NODE);
        assert_eq!(router.route(u64::MAX), DEFAULT_NODE);
    }

    #[test]
    fn add_splits_default_space() {
        let mut router = CacheRouter::default();
        router.add("a", 100, 200).unwrap();
        assert_eq!(
            intervals(&router),
            vec![
                (0, 100, "default".to_string()),
                (100, 200, "a".to_string())
            ]
        );
        assert_eq!(router.route(99), DEFAULT_NODE);
        assert_eq!(router.route(100), "a");
        assert_eq!(router.route(199), "a");
        assert_eq!(router.route(200), DEFAULT_NODE);
    }

    #[test]
    fn add_inside_existing_interval_splits_it() {
        let mut router = CacheRouter::default();
        router.add("a", 0, 1000).unwrap();
        router.add("b", 200, 300).unwrap();
        assert_eq!(
            intervals(&router),
            vec![
                (0, 200, "a".to_string()),
                (200, 300, "b".to_string()),
                (300, 1000, "a".to_string()),
            ]
        );
    }

    #[test]
    fn adjacent_same_node_merges() {
        let mut router = CacheRouter::default();
        router.add("a", 0, 100).unwrap();
        router.add("a", 100, 200).unwrap();
        assert_eq!(intervals(&router), vec![(0, 200, "a".to_string())]);
    }

    #[test]
    fn remove_node_falls_to_next_interval() {
        let mut router = CacheRouter::default();
        router.add("a", 0, 100).unwrap();
        router.add("b", 100, 200).unwrap();
        assert_eq!(router.remove_node("a").unwrap(), 1);
        assert_eq!(intervals(&router), vec![(0, 200, "b".to_string())]);
        assert!(matches!(
            router.remove_node("zzz"),
            Err(KvError::NotFound(_))
        ));
    }

    #[test]
    fn invalid_range_rejected() {
        let mut router = CacheRouter::default();
        assert!(matches!(router.add("a", 5, 5), Err(KvError::Invalid(_))));
        assert!(matches!(router.add("", 1, 5), Err(KvError::Invalid(_))));
    }

    #[tokio::test]
    async fn save_and_load_round_trip_through_kv() {
        let kv = MemoryKv::new();
        let mut router = CacheRouter::default();
        router.add("a", 10, 20).unwrap();
        router.save(&kv).await.unwrap();
        let loaded = CacheRouter::load(&kv).await.unwrap();
        assert_eq!(loaded, router);
    }

    struct MapConnector(HashMap<String, SharedKv>);

    #[async_trait]
    impl NodeConnector for MapConnector {
        async fn connect(&self, alias: &str, _node: &CacheNode) -> KvResult<SharedKv> {
            self.0
                .get(alias)
                .cloned()
                .ok_or_else(|| KvError::NotFound(alias.to_string()))
        }
    }

    #[tokio::test]
    async fn routed_nodes_resolve_clients() {
        let default = MemoryKv::new();
        let node_a = MemoryKv::new();
        node_a.set("marker", "a", None).await.unwrap();

        let mut router = CacheRouter::default();
        router.add("a", 100, 200).unwrap();
        router.save(&default).await.unwrap();
        save_node(
            &default,
            "a",
            &CacheNode {
                addr: "redis://a:6379".into(),
                password: None,
                db: 0,
            },
        )
        .await
        .unwrap();

        let routed = RoutedNodes::new(Arc::new(default));
        let mut clients: HashMap<String, SharedKv> = HashMap::new();
        clients.insert("a".into(), Arc::new(node_a));
        let count = routed.reload(&MapConnector(clients)).await.unwrap();
        assert_eq!(count, 1);

        let client = routed.client_for(150);
        assert_eq!(client.get("marker").await.unwrap().as_deref(), Some("a"));
        let client = routed.client_for(50);
        assert_eq!(client.get("marker").await.unwrap(), None);
    }
}
