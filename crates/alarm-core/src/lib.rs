//! alarm-core — shared types for the alarm detection pipeline.
//!
//! Every other crate in the workspace depends on this one for the
//! strategy model, the record/anomaly types that flow between stages,
//! the canonical hashing helpers and the process configuration.
//!
//! ```text
//! ingest ─► access ─► detect ─► emit ─► assign
//!   │         │         │        │        │
//!   └─────────┴── DataRecord / EventRecord / Anomaly / Alert ──┘
//! ```

pub mod clock;
pub mod config;
pub mod hashing;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{AlarmConfig, ConfigError, KvBackend};
pub use hashing::{anomaly_id, dimensions_md5, record_id};
pub use types::*;
