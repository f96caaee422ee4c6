//! Detection algorithms.
//!
//! Each configured [`Algorithm`] is compiled into a [`Detector`]. A
//! detector is pure: everything it looks at arrives in [`DetectInput`],
//! with past values pre-fetched by the engine from the timestamps the
//! detector asked for in [`Detector::history_points`].

mod partial_nodes;
mod ring_ratio;
mod threshold;
mod year_round;

use std::collections::HashMap;

use alarm_core::{Algorithm, AlgorithmKind};
use serde::de::DeserializeOwned;

use crate::error::{DetectError, DetectResult};

pub use partial_nodes::PartialNodes;
pub use ring_ratio::{AdvancedRingRatio, SimpleRingRatio};
pub use threshold::{Comparison, Threshold};
pub use year_round::{AdvancedYearRound, SimpleYearRound};

pub const DAY_SECS: i64 = 24 * 60 * 60;

/// What a detector sees for one point.
#[derive(Debug, Clone, Copy)]
pub struct DetectInput<'a> {
    pub value: f64,
    pub time: i64,
    pub interval: u64,
    /// Past values of the same series keyed by timestamp.
    pub history: &'a HashMap<i64, f64>,
    /// Values of every series of the same item at the same timestamp.
    pub peers: &'a [f64],
}

pub trait Detector: Send + Sync {
    fn kind(&self) -> AlgorithmKind;

    /// Timestamps of past values this detector reads.
    fn history_points(&self, _time: i64, _interval: u64) -> Vec<i64> {
        Vec::new()
    }

    /// `Some(message)` when the point is anomalous.
    fn detect(&self, input: &DetectInput<'_>) -> DetectResult<Option<String>>;
}

/// Compile one configured algorithm.
pub fn build(algorithm: &Algorithm) -> DetectResult<Box<dyn Detector>> {
    let detector: Box<dyn Detector> = match algorithm.kind {
        AlgorithmKind::Threshold => Box::new(Threshold::from_config(&algorithm.config)?),
        AlgorithmKind::SimpleRingRatio => Box::new(SimpleRingRatio(parse(algorithm)?)),
        AlgorithmKind::AdvancedRingRatio => Box::new(AdvancedRingRatio(parse(algorithm)?)),
        AlgorithmKind::SimpleYearRound => Box::new(SimpleYearRound(parse(algorithm)?)),
        AlgorithmKind::AdvancedYearRound => Box::new(AdvancedYearRound(parse(algorithm)?)),
        AlgorithmKind::PartialNodes => Box::new(PartialNodes::from_config(&algorithm.config)?),
        AlgorithmKind::Unknown => {
            return Err(DetectError::Unsupported(algorithm.kind.as_str().to_string()));
        }
    };
    Ok(detector)
}

fn parse<T: DeserializeOwned>(algorithm: &Algorithm) -> DetectResult<T> {
    serde_json::from_value(algorithm.config.clone())
        .map_err(|e| DetectError::config(algorithm.kind.as_str(), e.to_string()))
}

// ── Shared bound checks ────────────────────────────────────────

/// Percentage bounds against a reference value. A bound of `None` or
/// `0` is disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Deserialize)]
pub struct Bounds {
    #[serde(default)]
    pub floor: Option<f64>,
    #[serde(default)]
    pub ceil: Option<f64>,
}

impl Bounds {
    fn enabled(bound: Option<f64>) -> Option<f64> {
        bound.filter(|b| *b > 0.0)
    }

    /// Compare `value` against `reference`; describe the breach if any.
    pub(crate) fn check(&self, value: f64, reference: f64, against: &str) -> Option<String> {
        if reference == 0.0 {
            return None;
        }
        let change = (value - reference) / reference.abs() * 100.0;
        if let Some(ceil) = Self::enabled(self.ceil) {
            if change >= ceil {
                return Some(format!(
                    "{value} rose {change:.2}% against {against} {reference} (ceil {ceil}%)"
                ));
            }
        }
        if let Some(floor) = Self::enabled(self.floor) {
            if -change >= floor {
                return Some(format!(
                    "{value} fell {:.2}% against {against} {reference} (floor {floor}%)",
                    -change
                ));
            }
        }
        None
    }
}

/// Mean of the values present at `times`, `None` when none are.
pub(crate) fn mean_at(history: &HashMap<i64, f64>, times: impl Iterator<Item = i64>) -> Option<f64> {
    let (sum, n) = times
        .filter_map(|t| history.get(&t))
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}
