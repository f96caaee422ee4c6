//! alarmd — the alarm daemon.
//!
//! Assembles the pipeline stages into one process:
//! - KV connection (memory or Redis) and cache-router node routing
//! - Strategy and subscription refresh loops
//! - Partitioned access → detect → assign workers
//! - No-data sweeper
//! - HTTP ingest, `/metrics` and `/healthz`
//!
//! ```text
//! INBOUND_TOPIC ──┐
//! POST /v1/* ─────┴─► Dispatcher ─► workers ─► Pipeline ─► OUTBOUND_TOPIC
//!                                                      └─► ASSIGN_TOPIC
//! ```

pub mod assign_sink;
pub mod daemon;
pub mod http;
pub mod pipeline;
pub mod workers;

pub use assign_sink::AssignSink;
pub use daemon::{run, split_inbound};
pub use http::{build_router, HttpState};
pub use pipeline::{BatchReport, Pipeline};
pub use workers::{partition, spawn_workers, DispatchReport, Dispatcher, Job, JobKind};
