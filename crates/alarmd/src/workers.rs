//! Partitioned workers.
//!
//! Records are spread over `worker_count` bounded queues by their
//! `dimensions_md5`, so one series is always handled by the same worker,
//! whichever strategy routes it, and its points stay in order.
//!
//! ```text
//! dispatch(batch) ─► partition ─┬─► queue 0 ─► worker 0 ─► Pipeline
//!                               ├─► queue 1 ─► worker 1 ─► Pipeline
//!                               └─► ...
//! ```

use std::sync::Arc;

use alarm_access::series_md5;
use alarm_core::hashing::md5_hex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Points,
    Events,
}

#[derive(Debug)]
pub struct Job {
    pub kind: JobKind,
    pub batch: Vec<Value>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub accepted: usize,
    pub rejected: usize,
}

/// Worker index for one raw record: a hash of its `dimensions_md5`.
/// Records with malformed dimensions go to worker 0, where parsing rejects
/// them.
pub fn partition(raw: &Value, workers: usize) -> usize {
    if workers <= 1 {
        return 0;
    }
    let Some(series) = series_md5(raw) else {
        return 0;
    };
    let digest = md5_hex(&series);
    let head = u32::from_str_radix(&digest[..8], 16).unwrap_or(0);
    head as usize % workers
}

#[derive(Clone)]
pub struct Dispatcher {
    senders: Vec<mpsc::Sender<Job>>,
}

impl Dispatcher {
    pub fn new(senders: Vec<mpsc::Sender<Job>>) -> Self {
        Self { senders }
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Queue a batch. Waits while a worker's queue is full; records that
    /// are not JSON objects, or whose worker has stopped, are rejected.
    pub async fn dispatch(&self, kind: JobKind, batch: Vec<Value>) -> DispatchReport {
        let mut report = DispatchReport::default();
        if self.senders.is_empty() {
            report.rejected = batch.len();
            return report;
        }

        let mut parts: Vec<Vec<Value>> = vec![Vec::new(); self.senders.len()];
        for raw in batch {
            if !raw.is_object() {
                report.rejected += 1;
                continue;
            }
            parts[partition(&raw, self.senders.len())].push(raw);
        }

        for (sender, part) in self.senders.iter().zip(parts) {
            if part.is_empty() {
                continue;
            }
            let len = part.len();
            match sender.send(Job { kind, batch: part }).await {
                Ok(()) => report.accepted += len,
                Err(_) => report.rejected += len,
            }
        }
        report
    }
}

/// Start `count` workers over `pipeline`. A worker that hits a fatal KV
/// error reports it on `fatal_tx` and stops.
pub fn spawn_workers(
    pipeline: Arc<Pipeline>,
    count: usize,
    capacity: usize,
    fatal_tx: mpsc::Sender<String>,
) -> (Dispatcher, Vec<JoinHandle<()>>) {
    let count = count.max(1);
    let mut senders = Vec::with_capacity(count);
    let mut handles = Vec::with_capacity(count);
    for worker in 0..count {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        senders.push(tx);
        handles.push(tokio::spawn(run_worker(
            worker,
            pipeline.clone(),
            rx,
            fatal_tx.clone(),
        )));
    }
    info!(workers = count, capacity, "workers started");
    (Dispatcher::new(senders), handles)
}

async fn run_worker(
    worker: usize,
    pipeline: Arc<Pipeline>,
    mut rx: mpsc::Receiver<Job>,
    fatal_tx: mpsc::Sender<String>,
) {
    while let Some(job) = rx.recv().await {
        let report = match job.kind {
            JobKind::Points => pipeline.process_points(&job.batch).await,
            JobKind::Events => pipeline.process_events(&job.batch).await,
        };
        debug!(
            worker,
            kind = ?job.kind,
            received = report.received,
            accepted = report.accepted,
            anomalies = report.anomalies,
            "batch processed"
        );
        if let Some(e) = report.fatal {
            error!(worker, error = %e, "kv unavailable, worker stopping");
            let _ = fatal_tx.send(format!("worker {worker}: {e}")).await;
            return;
        }
    }
    debug!(worker, "worker drained");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn same_series_lands_on_same_worker() {
        let a = json!({ "query_md5": "qm1", "time": 60, "dimensions": { "ip": "10.0.0.1" } });
        let b = json!({ "query_md5": "qm1", "time": 120, "dimensions": { "ip": "10.0.0.1" } });
        for workers in [2, 3, 8] {
            assert_eq!(partition(&a, workers), partition(&b, workers));
            assert!(partition(&a, workers) < workers);
        }
        assert_eq!(partition(&a, 1), 0);
        assert_eq!(partition(&a, 0), 0);
    }

    #[test]
    fn series_ignores_route_and_scalar_types() {
        let s1 = json!({ "strategy_id": 1, "time": 60, "value": 1, "dimensions": { "ip": "10.0.0.1" } });
        let s2 = json!({ "strategy_id": 2, "item_id": 21, "time": 60, "value": 1, "dimensions": { "ip": "10.0.0.1" } });
        let qm = json!({ "query_md5": "qm9", "time": 60, "value": 1, "dimensions": { "ip": "10.0.0.1" } });
        let int_dim = json!({ "strategy_id": 1, "dimensions": { "ip": 0, "bk_cloud_id": 2 } });
        let str_dim = json!({ "strategy_id": 3, "dimensions": { "bk_cloud_id": "2", "ip": "0" } });
        for workers in 2..=8 {
            assert_eq!(partition(&s1, workers), partition(&s2, workers), "workers={workers}");
            assert_eq!(partition(&s1, workers), partition(&qm, workers), "workers={workers}");
            assert_eq!(partition(&int_dim, workers), partition(&str_dim, workers), "workers={workers}");
        }
    }

    #[test]
    fn supplied_dimensions_md5_picks_the_worker() {
        let dims = std::collections::BTreeMap::from([("ip".to_string(), "10.0.0.1".to_string())]);
        let dmd5 = alarm_core::dimensions_md5(&dims);
        let with_dims = json!({ "strategy_id": 1, "dimensions": { "ip": "10.0.0.1" } });
        let with_md5 = json!({ "strategy_id": 1, "dimensions_md5": dmd5 });
        for workers in 2..=8 {
            assert_eq!(partition(&with_dims, workers), partition(&with_md5, workers));
        }
        assert_eq!(partition(&json!({ "dimensions": [1] }), 4), 0);
    }

    #[test]
    fn series_spread_over_workers() {
        let used: std::collections::HashSet<usize> = (0..64)
            .map(|i| {
                let raw = json!({ "query_md5": "qm1", "dimensions": { "ip": format!("10.0.0.{i}") } });
                partition(&raw, 4)
            })
            .collect();
        assert!(used.len() > 1);
    }

    #[tokio::test]
    async fn dispatch_rejects_non_objects_and_closed_queues() {
        let (tx0, mut rx0) = mpsc::channel(8);
        let (tx1, rx1) = mpsc::channel(8);
        drop(rx1);
        let dispatcher = Dispatcher::new(vec![tx0, tx1]);

        let batch: Vec<Value> = (0..32)
            .map(|i| json!({ "query_md5": "qm1", "dimensions": { "ip": format!("10.0.0.{i}") } }))
            .chain([json!(42), json!("text")])
            .collect();
        let expected_open = batch
            .iter()
            .filter(|r| r.is_object() && partition(r, 2) == 0)
            .count();

        let report = dispatcher.dispatch(JobKind::Points, batch).await;
        assert_eq!(report.accepted, expected_open);
        assert_eq!(report.rejected, 34 - expected_open);

        if expected_open > 0 {
            let job = rx0.recv().await.unwrap();
            assert_eq!(job.kind, JobKind::Points);
            assert_eq!(job.batch.len(), expected_open);
        }
    }

    #[tokio::test]
    async fn empty_dispatcher_rejects_everything() {
        let report = Dispatcher::new(Vec::new())
            .dispatch(JobKind::Events, vec![json!({})])
            .await;
        assert_eq!(report, DispatchReport { accepted: 0, rejected: 1 });
    }
}
