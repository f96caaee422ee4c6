//! alarm-strategy — the strategy view every pipeline stage reads.
//!
//! Strategies are loaded from a [`StrategySource`] into an immutable
//! [`StrategySnapshot`]. The [`StrategyCache`] swaps a new snapshot in
//! on a fixed cadence (or after [`StrategyCache::invalidate`]); readers
//! pin an `Arc` to one snapshot for the length of a record batch, so a
//! refresh never changes the view in the middle of a batch.
//!
//! ```text
//! StrategySource ──load()──► StrategySnapshot ──swap──► StrategyCache
//!   (KV hash | JSON file | static)   arena + indexes          │
//!                                                 pinned() ───┴──► stages
//! ```

pub mod cache;
pub mod error;
pub mod snapshot;
pub mod source;

pub use cache::{RefreshStats, StrategyCache};
pub use error::{StrategyError, StrategyResult};
pub use snapshot::{ItemRef, StrategySnapshot};
pub use source::{FileStrategySource, KvStrategySource, StaticStrategySource, StrategySource};
