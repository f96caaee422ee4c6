//! alarm-metrics — observability for the alarm pipeline.
//!
//! Every component reports into one shared [`PipelineMetrics`]: records
//! in, records dropped (by stage and reason), exhausted token groups,
//! emitted anomalies, KV and algorithm errors, local cache statistics
//! and the time of the last successful cycle per background loop.
//!
//! # Architecture
//!
//! ```text
//! PipelineMetrics
//!   ├── record_dropped() / token_exhausted() / ...   ← hot path, atomics
//!   ├── register_cache() ← caches hand over their CacheStats
//!   ├── snapshot() → Vec<MetricFamily>
//!   └── run_reporter() → periodic summary log line
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{CacheStats, DropReason, MetricFamily, MetricKind, PipelineMetrics, Sample};
pub use prometheus::render_prometheus;
