//! alarm-access — the first stage of the alarm pipeline.
//!
//! Turns raw JSON points and events into typed records matched to
//! strategy items, then narrows each record's item set through a chain
//! of gates. A record leaves the stage only while at least one of its
//! items is still retained and not inhibited.
//!
//! ```text
//! raw JSON ─► parse/match ─► expire ─► duplicate ─► time-point limit
//!                                                        │
//!        output ◄── token ◄── drop dups ◄── priority ◄── range
//! ```

pub mod duplicate;
pub mod error;
pub mod filters;
pub mod pipeline;
pub mod priority;
pub mod records;
pub mod token;

pub use duplicate::DuplicateFilter;
pub use error::{AccessError, AccessResult};
pub use filters::{ExpireFilter, RangeFilter, TimePointLimiter};
pub use pipeline::{AccessOutput, AccessPipeline, AccessStats};
pub use priority::{PriorityChecker, PriorityEntry, PriorityStats};
pub use records::{parse_event, parse_point, series_md5, RecordRoute};
pub use token::{TokenBucket, TokenDecision, TokenEntry};
