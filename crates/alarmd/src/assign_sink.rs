//! Anomaly sink that runs the assign stage inline.

use std::sync::Arc;

use alarm_assign::{alert_view, AssignError, AssignRouter};
use alarm_core::{AnomalyMessage, ItemKey};
use alarm_detect::{AnomalySink, DetectError, DetectResult};
use alarm_kv::SharedKv;
use alarm_strategy::StrategyCache;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Routes each emitted anomaly to its subscribers and publishes the
/// resulting notice on the assign channel. Anomalies nobody subscribed to
/// are dropped here.
pub struct AssignSink {
    strategies: Arc<StrategyCache>,
    router: Arc<AssignRouter>,
    kv: SharedKv,
    channel: String,
}

impl AssignSink {
    pub fn new(
        strategies: Arc<StrategyCache>,
        router: Arc<AssignRouter>,
        kv: SharedKv,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            strategies,
            router,
            kv,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl AnomalySink for AssignSink {
    async fn publish(&self, message: &AnomalyMessage) -> DetectResult<()> {
        let snapshot = self.strategies.snapshot();
        let key = ItemKey::new(message.strategy_id, message.item_id);
        let Some(item) = snapshot.item(key) else {
            debug!(
                strategy_id = message.strategy_id,
                item_id = message.item_id,
                "strategy gone before assign, skipping"
            );
            return Ok(());
        };
        let alert = alert_view(message, item.strategy, item.item);

        let notice = match self.router.assign(&alert).await {
            Ok(notice) => notice,
            Err(AssignError::Kv(e)) if e.is_fatal() => return Err(DetectError::Kv(e)),
            Err(e) => {
                warn!(anomaly_id = %alert.anomaly_id, error = %e, "assign failed");
                return Ok(());
            }
        };
        if notice.matches.is_empty() {
            return Ok(());
        }

        let payload = serde_json::to_string(&notice)?;
        self.kv.publish(&self.channel, &payload).await?;
        debug!(
            anomaly_id = %notice.anomaly_id,
            users = notice.matches.len(),
            "assign notice published"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "assign"
    }
}
