//! Daemon assembly: connect, warm caches, start loops and serve.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alarm_core::clock::system_clock;
use alarm_core::{AlarmConfig, KvBackend};
use alarm_kv::{KvClient, KvRoute, RedisConnector, RetryPolicy, RoutedNodes, SharedKv, SingleNode};
use alarm_metrics::PipelineMetrics;
use alarm_strategy::{FileStrategySource, KvStrategySource, StrategySource};
use anyhow::Context;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::http::{build_router, HttpState};
use crate::pipeline::Pipeline;
use crate::workers::{spawn_workers, Dispatcher, JobKind};

const NO_DATA_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const CACHE_ROUTER_RELOAD_INTERVAL: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 64;
const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(300);

/// Split one inbound message into point and event records. A message is
/// a single record or an array of them; records carrying `event_name` are
/// events.
pub fn split_inbound(payload: &str) -> Option<(Vec<Value>, Vec<Value>)> {
    let records = match serde_json::from_str::<Value>(payload).ok()? {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return None,
    };
    Some(
        records
            .into_iter()
            .partition(|r| r.get("event_name").is_none()),
    )
}

async fn dispatch_chunked(dispatcher: &Dispatcher, kind: JobKind, records: Vec<Value>, batch_size: usize) {
    let mut records = records.into_iter().peekable();
    while records.peek().is_some() {
        let chunk: Vec<Value> = records.by_ref().take(batch_size.max(1)).collect();
        let report = dispatcher.dispatch(kind, chunk).await;
        if report.rejected > 0 {
            warn!(kind = ?kind, rejected = report.rejected, "inbound records rejected");
        }
    }
}

/// Feed `topic` into the workers until shutdown.
async fn consume_inbound(
    kv: SharedKv,
    topic: String,
    batch_size: usize,
    dispatcher: Dispatcher,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut inbound = kv
        .subscribe(&topic)
        .await
        .with_context(|| format!("subscribing to {topic}"))?;
    info!(%topic, "inbound consumer started");
    loop {
        tokio::select! {
            message = inbound.recv() => {
                let Some(payload) = message else {
                    warn!(%topic, "inbound subscription closed");
                    break;
                };
                let Some((points, events)) = split_inbound(&payload) else {
                    warn!(%topic, bytes = payload.len(), "dropping malformed inbound message");
                    continue;
                };
                dispatch_chunked(&dispatcher, JobKind::Points, points, batch_size).await;
                dispatch_chunked(&dispatcher, JobKind::Events, events, batch_size).await;
            }
            _ = shutdown.changed() => break,
        }
    }
    info!(%topic, "inbound consumer stopped");
    Ok(())
}

async fn reload_router_loop(
    routes: Arc<RoutedNodes>,
    connector: RedisConnector,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CACHE_ROUTER_RELOAD_INTERVAL) => {
                if let Err(e) = routes.reload(&connector).await {
                    warn!(error = %e, "cache router reload failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Run the daemon until ctrl-c or a fatal KV outage. Returns an error in
/// the latter case so the process exits non-zero.
pub async fn run(config: AlarmConfig) -> anyhow::Result<()> {
    info!(
        kv = %config.kv.addr,
        workers = config.worker_count,
        inbound = %config.inbound_topic,
        "alarm daemon starting"
    );

    // ── Storage ────────────────────────────────────────────────

    let kv = alarm_kv::connect(&config.kv).await.context("connecting to kv")?;
    kv.ping().await.context("kv ping")?;
    let backend = config.kv.backend()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();

    let route: Arc<dyn KvRoute> = match backend {
        KvBackend::Memory => Arc::new(SingleNode(kv.clone())),
        KvBackend::Redis { .. } => {
            let routes = Arc::new(RoutedNodes::new(kv.clone()));
            let policy = RetryPolicy::new(
                Duration::from_millis(config.kv.timeout_ms),
                Duration::from_secs(config.kv.grace_secs),
            );
            let connector = RedisConnector { policy };
            routes.reload(&connector).await.context("loading cache router")?;
            background.push(tokio::spawn(reload_router_loop(
                routes.clone(),
                connector,
                shutdown_rx.clone(),
            )));
            routes as Arc<dyn KvRoute>
        }
    };

    // ── Pipeline ───────────────────────────────────────────────

    let source: Arc<dyn StrategySource> = match &config.strategy_file {
        Some(path) => Arc::new(FileStrategySource::new(path.clone())),
        None => Arc::new(KvStrategySource::new(kv.clone())),
    };
    let metrics = Arc::new(PipelineMetrics::new());
    let pipeline = Arc::new(Pipeline::new(
        &config,
        kv.clone(),
        route,
        source,
        system_clock(),
        metrics.clone(),
    ));

    let stats = pipeline.strategies.refresh().await.context("initial strategy load")?;
    info!(strategies = stats.strategies, items = stats.items, "strategies loaded");
    match pipeline.subscriptions.refresh().await {
        Ok(stats) => info!(users = stats.users, "subscriptions loaded"),
        Err(e) if e.is_fatal() => return Err(e).context("initial subscription load"),
        Err(e) => warn!(error = %e, "initial subscription load failed"),
    }

    // ── Background loops ───────────────────────────────────────

    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(8);
    let (dispatcher, workers) = spawn_workers(
        pipeline.clone(),
        config.worker_count,
        QUEUE_CAPACITY,
        fatal_tx.clone(),
    );

    {
        let strategies = pipeline.strategies.clone();
        let interval = Duration::from_secs(config.strategy_refresh_secs);
        let rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move { strategies.run(interval, rx).await }));
    }
    {
        let subscriptions = pipeline.subscriptions.clone();
        let interval = Duration::from_secs(config.subscribe_refresh_secs);
        let rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move { subscriptions.run(interval, rx).await }));
    }
    {
        let pipeline = pipeline.clone();
        let fatal_tx = fatal_tx.clone();
        let rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = pipeline.sweeper.run(NO_DATA_SWEEP_INTERVAL, rx).await {
                error!(error = %e, "no-data sweeper stopped");
                let _ = fatal_tx.send(format!("no-data sweeper: {e}")).await;
            }
        }));
    }
    {
        let metrics = metrics.clone();
        let rx = shutdown_rx.clone();
        background.push(tokio::spawn(async move {
            metrics.run_reporter(METRICS_REPORT_INTERVAL, rx).await
        }));
    }
    {
        let kv = kv.clone();
        let topic = config.inbound_topic.clone();
        let batch_size = config.batch_size;
        let dispatcher = dispatcher.clone();
        let rx = shutdown_rx.clone();
        let fatal_tx = fatal_tx.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = consume_inbound(kv, topic, batch_size, dispatcher, rx).await {
                error!(error = %e, "inbound consumer failed");
                let _ = fatal_tx.send(format!("inbound consumer: {e:#}")).await;
            }
        }));
    }
    drop(fatal_tx);

    // ── HTTP ───────────────────────────────────────────────────

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_addr))?;
    let router = build_router(HttpState {
        dispatcher,
        kv: kv.clone(),
        metrics,
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server starting");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            None
        }
        reason = fatal_rx.recv() => reason,
    };
    let _ = shutdown_tx.send(true);

    // ── Drain ──────────────────────────────────────────────────

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "http server error"),
        Err(e) => warn!(error = %e, "http server task failed"),
        Ok(Ok(())) => {}
    }
    let drained = tokio::time::timeout(grace, async {
        futures::future::join_all(background).await;
        futures::future::join_all(workers).await;
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = grace.as_secs(), "workers did not drain in time");
    } else {
        debug!("workers drained");
    }

    match fatal {
        Some(reason) => {
            error!(%reason, "kv unavailable, exiting");
            anyhow::bail!("kv unavailable: {reason}")
        }
        None => {
            info!("alarm daemon stopped");
            Ok(())
        }
    }
}
