//! Editing the strategy-id → KV node route table.

use std::io::Write;

use alarm_kv::router::{delete_node, load_nodes, save_node, DEFAULT_NODE};
use alarm_kv::{CacheNode, CacheRouter, KvClient};

use super::UsageError;

pub async fn list(kv: &dyn KvClient, out: &mut impl Write) -> anyhow::Result<()> {
    let router = CacheRouter::load(kv).await?;
    let nodes = load_nodes(kv).await?;
    if router.is_empty() {
        writeln!(out, "every strategy routes to {DEFAULT_NODE}")?;
    }
    for interval in router.intervals() {
        let addr = nodes
            .get(&interval.node)
            .map_or("-", |n| n.addr.as_str());
        writeln!(
            out,
            "[{}, {})\t{}\t{}",
            interval.floor, interval.ceil, interval.node, addr
        )?;
    }
    Ok(())
}

/// Route `[floor, ceil)` to `node`. An unknown node must come with its
/// address, which is registered first.
pub async fn add(
    kv: &dyn KvClient,
    node: &str,
    floor: u64,
    ceil: u64,
    register: Option<CacheNode>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match register {
        Some(config) => save_node(kv, node, &config).await?,
        None if node == DEFAULT_NODE => {}
        None => {
            if !load_nodes(kv).await?.contains_key(node) {
                return Err(UsageError::UnknownNode(node.to_string()).into());
            }
        }
    }
    let mut router = CacheRouter::load(kv).await?;
    router.add(node, floor, ceil)?;
    router.save(kv).await?;
    tracing::info!(%node, floor, ceil, "cache route added");
    writeln!(out, "routed [{floor}, {ceil}) to {node}")?;
    Ok(())
}

pub async fn remove_node(kv: &dyn KvClient, node: &str, out: &mut impl Write) -> anyhow::Result<usize> {
    if node == DEFAULT_NODE {
        return Err(UsageError::Invalid(format!("{DEFAULT_NODE} cannot be removed")).into());
    }
    let mut router = CacheRouter::load(kv).await?;
    let removed = router.remove_node(node)?;
    router.save(kv).await?;
    delete_node(kv, node).await?;
    tracing::info!(%node, removed, "cache node removed");
    writeln!(out, "removed {removed} interval(s) of {node}")?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use alarm_kv::{KvError, MemoryKv};

    use super::*;
    use crate::commands::{exit_code, EXIT_USER};

    fn node(addr: &str) -> CacheNode {
        CacheNode {
            addr: addr.to_string(),
            password: None,
            db: 0,
        }
    }

    #[tokio::test]
    async fn add_list_and_remove() {
        let kv = MemoryKv::new();
        let mut out = Vec::new();
        add(&kv, "cache-1", 100, 200, Some(node("redis://10.0.0.5:6379")), &mut out)
            .await
            .unwrap();
        add(&kv, "cache-1", 200, 300, None, &mut out).await.unwrap();

        let router = CacheRouter::load(&kv).await.unwrap();
        assert_eq!(router.route(150), "cache-1");
        assert_eq!(router.route(250), "cache-1");
        assert_eq!(router.route(50), DEFAULT_NODE);

        let mut listing = Vec::new();
        list(&kv, &mut listing).await.unwrap();
        let text = String::from_utf8(listing).unwrap();
        assert!(text.contains("[100, 300)\tcache-1\tredis://10.0.0.5:6379"));

        let removed = remove_node(&kv, "cache-1", &mut out).await.unwrap();
        assert_eq!(removed, 1);
        assert!(CacheRouter::load(&kv).await.unwrap().is_empty());
        assert!(load_nodes(&kv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn operator_mistakes_are_user_errors() {
        let kv = MemoryKv::new();
        let mut out = Vec::new();

        let err = add(&kv, "cache-9", 0, 10, None, &mut out).await.unwrap_err();
        assert!(err.is::<UsageError>());
        assert_eq!(exit_code(&err), EXIT_USER);

        let err = add(&kv, DEFAULT_NODE, 10, 10, None, &mut out).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<KvError>(), Some(KvError::Invalid(_))));
        assert_eq!(exit_code(&err), EXIT_USER);

        let err = remove_node(&kv, "cache-9", &mut out).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<KvError>(), Some(KvError::NotFound(_))));
        assert_eq!(exit_code(&err), EXIT_USER);
    }
}
