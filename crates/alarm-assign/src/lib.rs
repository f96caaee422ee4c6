//! alarm-assign — who gets told about an alert.
//!
//! Subscriptions are flattened per business and user by
//! [`SubscribeCache::refresh`]; [`AssignRouter`] evaluates an alert
//! against the rules of every subscribed user of its business.
//!
//! ```text
//! NOTICE_SUBSCRIBE ─► SubscribeCache ─► SUBSCRIBE.biz_* / SUBSCRIBE.user_*
//!                                               │
//! Alert ──────────────► AssignRouter ◄──────────┘
//!                          │  ▲
//!                          │  └── TopologyCache (TOPO.biz_*)
//!                          ▼
//!                     AssignNotice
//! ```

pub mod condition;
pub mod error;
pub mod router;
pub mod subscribe;
pub mod topo;

pub use condition::{Composite, Condition, ConditionGroups, Method};
pub use error::{AssignError, AssignResult};
pub use router::{alert_view, AssignMatch, AssignNotice, AssignRouter};
pub use subscribe::{CompiledRule, NoticeSubscribe, SubscribeCache, SubscribeRefreshStats, SubscribeRule};
pub use topo::{host_key, TopologyCache};
