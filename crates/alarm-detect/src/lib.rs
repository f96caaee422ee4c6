//! alarm-detect — the detect stage of the pipeline.
//!
//! Access hands over de-duplicated records tagged with the items they
//! belong to. Every (record, item) pair runs through the item's
//! algorithms; results are persisted as check results and anomalies
//! leave through an [`AnomalySink`].
//!
//! ```text
//!  DataRecord ─► DetectEngine ──► algorithms ──► DoubleCheckRegistry
//!                    │                                  │
//!                    │ HistoryStore (DETECT_HISTORY)    ▼
//!                    └──────────────────────────► AnomalyEmitter
//!                                                   │        │
//!                              CheckResultStore ◄───┘        └──► AnomalySink
//!                                    ▲
//!  NoDataSweeper (per period) ───────┘
//! ```

pub mod algorithms;
pub mod check_result;
pub mod double_check;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod history;
pub mod nodata;

pub use check_result::{ANOMALY_LABEL, CheckResultStore, SERVICE, TrimStats};
pub use double_check::{
    CheckContext, DoubleCheckGate, DoubleCheckRegistry, DoubleCheckStrategy, SumFunctionByMissingPoints,
    Verdict,
};
pub use emitter::{AnomalyEmitter, AnomalySink, ChannelSink, Emission, FanoutSink, KvPublishSink};
pub use engine::{DetectEngine, DetectOutput, DetectStats};
pub use error::{DetectError, DetectResult};
pub use history::{HistoryPoint, HistoryStore};
pub use nodata::{NoDataStats, NoDataSweeper};
