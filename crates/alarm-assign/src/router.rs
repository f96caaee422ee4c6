//! Routing an alert to the users subscribed to it.
//!
//! ```text
//! Alert ─► topology (when unresolved) ─► SUBSCRIBE.biz_{biz} users
//!            └─► per user: rules by (-priority, id), first match wins
//! ```

use std::sync::Arc;

use alarm_core::{Alert, AnomalyMessage, Item, Strategy};
use alarm_metrics::PipelineMetrics;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AssignResult;
use crate::subscribe::SubscribeCache;
use crate::topo::TopologyCache;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignMatch {
    pub username: String,
    pub user_type: String,
    pub user_group: Vec<String>,
    pub priority: i64,
    pub notice_ways: Vec<String>,
    pub rule_id: u64,
}

/// What the assign stage publishes for one anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignNotice {
    pub anomaly_id: String,
    pub bk_biz_id: i64,
    pub strategy_id: u64,
    pub matches: Vec<AssignMatch>,
}

/// The alert view of an emitted anomaly.
pub fn alert_view(message: &AnomalyMessage, strategy: &Strategy, item: &Item) -> Alert {
    Alert {
        anomaly_id: message.trigger.anomaly_ids.first().cloned().unwrap_or_default(),
        bk_biz_id: strategy.bk_biz_id,
        strategy_id: strategy.id,
        alert_name: strategy.name.clone(),
        severity: message.trigger.level,
        dimensions: message.data.dimensions.clone(),
        labels: strategy.labels.clone(),
        data_source_labels: item.data_source_labels.iter().cloned().collect(),
        topo_nodes: None,
    }
}

pub struct AssignRouter {
    subscriptions: Arc<SubscribeCache>,
    topology: Option<Arc<TopologyCache>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl AssignRouter {
    pub fn new(subscriptions: Arc<SubscribeCache>) -> Self {
        Self {
            subscriptions,
            topology: None,
            metrics: None,
        }
    }

    pub fn with_topology(mut self, topology: Arc<TopologyCache>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One match per subscribed user whose rules accept the alert.
    pub async fn route(&self, alert: &Alert) -> AssignResult<Vec<AssignMatch>> {
        let users = self.subscriptions.biz_users(alert.bk_biz_id).await?;
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let mut resolved;
        let alert = match (&alert.topo_nodes, &self.topology) {
            (None, Some(topology)) => {
                resolved = alert.clone();
                resolved.topo_nodes = topology.resolve(alert).await?;
                &resolved
            }
            _ => alert,
        };

        let mut matches = Vec::new();
        for username in users.iter() {
            let rules = self.subscriptions.user_rules(alert.bk_biz_id, username).await?;
            if let Some(hit) = rules.iter().find(|r| r.is_match(alert)) {
                matches.push(AssignMatch {
                    username: username.clone(),
                    user_type: hit.rule.user_type.clone(),
                    user_group: hit.rule.user_group.clone(),
                    priority: hit.rule.priority,
                    notice_ways: hit.rule.notice_ways.clone(),
                    rule_id: hit.rule.id,
                });
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.assign_matched(alert.bk_biz_id, matches.len() as u64);
        }
        debug!(
            anomaly_id = %alert.anomaly_id,
            bk_biz_id = alert.bk_biz_id,
            users = users.len(),
            matched = matches.len(),
            "alert routed"
        );
        Ok(matches)
    }

    pub async fn assign(&self, alert: &Alert) -> AssignResult<AssignNotice> {
        let matches = self.route(alert).await?;
        Ok(AssignNotice {
            anomaly_id: alert.anomaly_id.clone(),
            bk_biz_id: alert.bk_biz_id,
            strategy_id: alert.strategy_id,
            matches,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::num::NonZeroUsize;
    use std::time::Duration;

    use alarm_kv::keys::{self, NOTICE_SUBSCRIBE};
    use alarm_kv::{KvClient, MemoryKv};
    use serde_json::json;

    use super::*;

    struct Harness {
        kv: Arc<MemoryKv>,
        router: AssignRouter,
        metrics: Arc<PipelineMetrics>,
    }

    async fn harness(rows: &[serde_json::Value]) -> Harness {
        let kv = Arc::new(MemoryKv::new());
        for row in rows {
            kv.hset(NOTICE_SUBSCRIBE, &row["id"].to_string(), &row.to_string())
                .await
                .unwrap();
        }
        let metrics = Arc::new(PipelineMetrics::new());
        let subscriptions = Arc::new(
            SubscribeCache::new(kv.clone(), NonZeroUsize::new(64).unwrap(), Duration::from_secs(60))
                .with_metrics(metrics.clone()),
        );
        subscriptions.refresh().await.unwrap();
        let topology = Arc::new(TopologyCache::new(
            kv.clone(),
            NonZeroUsize::new(8).unwrap(),
            Duration::from_secs(60),
        ));
        let router = AssignRouter::new(subscriptions)
            .with_topology(topology)
            .with_metrics(metrics.clone());
        Harness { kv, router, metrics }
    }

    fn alert(dims: &[(&str, &str)]) -> Alert {
        Alert {
            anomaly_id: "d.1000.1.11.2".to_string(),
            bk_biz_id: 2,
            strategy_id: 1,
            dimensions: dims
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cluster_rule_matches_only_its_cluster() {
        let h = harness(&[json!({
            "id": 1, "bk_biz_id": 2, "username": "alice", "priority": 1,
            "conditions": [{ "field": "bcs_cluster_id", "method": "eq", "value": ["C1"], "composite": "and" }],
            "user_type": "group", "notice_ways": ["weixin"],
        })])
        .await;

        let matches = h.router.route(&alert(&[("bcs_cluster_id", "C1")])).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].username, "alice");
        assert_eq!(matches[0].notice_ways, vec!["weixin"]);
        assert_eq!(matches[0].user_type, "group");

        let matches = h.router.route(&alert(&[("bcs_cluster_id", "C2")])).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn highest_priority_rule_wins_per_user() {
        let h = harness(&[
            json!({ "id": 1, "bk_biz_id": 2, "username": "alice", "priority": 1, "notice_ways": ["mail"] }),
            json!({ "id": 2, "bk_biz_id": 2, "username": "alice", "priority": 9, "notice_ways": ["sms"] }),
            json!({ "id": 3, "bk_biz_id": 2, "username": "bob", "priority": 1, "notice_ways": ["mail"],
                    "conditions": [{ "field": "env", "method": "eq", "value": ["prod"] }] }),
        ])
        .await;

        let notice = h.router.assign(&alert(&[("env", "test")])).await.unwrap();
        assert_eq!(notice.anomaly_id, "d.1000.1.11.2");
        assert_eq!(notice.matches.len(), 1);
        assert_eq!(notice.matches[0].rule_id, 2);
        assert_eq!(notice.matches[0].notice_ways, vec!["sms"]);
    }

    #[tokio::test]
    async fn topology_is_resolved_for_topo_rules() {
        let h = harness(&[json!({
            "id": 1, "bk_biz_id": 2, "username": "alice",
            "conditions": [{ "field": "host_topo_node", "method": "eq",
                             "value": [{ "bk_obj_id": "module", "bk_inst_id": 9 }] }],
        })])
        .await;
        h.kv.hset(&keys::topology(2), "10.0.0.1|0", r#"["set|5","module|9"]"#)
            .await
            .unwrap();

        let known = alert(&[("bk_target_ip", "10.0.0.1")]);
        assert_eq!(h.router.route(&known).await.unwrap().len(), 1);

        let unknown = alert(&[("bk_target_ip", "10.0.0.7")]);
        assert!(h.router.route(&unknown).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_business_has_no_subscribers() {
        let h = harness(&[json!({ "id": 1, "bk_biz_id": 3, "username": "carol" })]).await;
        assert!(h.router.route(&alert(&[])).await.unwrap().is_empty());
        let misses = h
            .metrics
            .snapshot()
            .into_iter()
            .find(|f| f.name == "alarm_cache_misses_total")
            .unwrap();
        assert!(misses
            .samples
            .iter()
            .any(|s| s.labels[0].1 == "subscribe" && s.value == 1.0));
    }

    #[test]
    fn alert_view_copies_strategy_and_point() {
        let strategy: Strategy = serde_json::from_value(json!({
            "id": 1, "bk_biz_id": 2, "name": "CPU high", "labels": ["os"],
            "items": [{ "id": 11, "data_source_labels": ["bk_monitor"] }],
        }))
        .unwrap();
        let message: AnomalyMessage = serde_json::from_value(json!({
            "data": { "record_id": "d.1000", "value": 95.0, "values": {}, "dimensions": { "ip": "10.0.0.1" }, "time": 1000 },
            "anomaly": {},
            "strategy_snapshot_key": "bkmonitor.STRATEGY_SNAPSHOT.1.1",
            "trigger": { "level": 1, "anomaly_ids": ["d.1000.1.11.1"] },
        }))
        .unwrap();
        let view = alert_view(&message, &strategy, &strategy.items[0]);
        assert_eq!(view.anomaly_id, "d.1000.1.11.1");
        assert_eq!(view.alert_name, "CPU high");
        assert_eq!(view.labels, vec!["os"]);
        assert_eq!(view.data_source_labels, vec!["bk_monitor"]);
        assert_eq!(view.dimensions["ip"], "10.0.0.1");
        assert!(view.topo_nodes.is_none());
    }
}
