//! Year round: change against the same time of day on earlier days.

use alarm_core::AlgorithmKind;
use serde::Deserialize;

use super::{mean_at, Bounds, DetectInput, Detector, DAY_SECS};
use crate::error::DetectResult;

/// Compare with the same time yesterday.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleYearRound(pub Bounds);

impl Detector for SimpleYearRound {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::SimpleYearRound
    }

    fn history_points(&self, time: i64, _interval: u64) -> Vec<i64> {
        vec![time - DAY_SECS]
    }

    fn detect(&self, input: &DetectInput<'_>) -> DetectResult<Option<String>> {
        Ok(input
            .history
            .get(&(input.time - DAY_SECS))
            .and_then(|reference| self.0.check(input.value, *reference, "same time yesterday")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AdvancedYearRoundConfig {
    #[serde(default)]
    pub floor: Option<f64>,
    #[serde(default)]
    pub ceil: Option<f64>,
    /// Days averaged for the falling check.
    #[serde(default = "default_days")]
    pub floor_interval: u32,
    /// Days averaged for the rising check.
    #[serde(default = "default_days")]
    pub ceil_interval: u32,
}

fn default_days() -> u32 {
    7
}

/// Compare with the mean of the same time over the last N days.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvancedYearRound(pub AdvancedYearRoundConfig);

fn days_back(time: i64, days: u32) -> impl Iterator<Item = i64> {
    (1..=days as i64).map(move |d| time - d * DAY_SECS)
}

impl Detector for AdvancedYearRound {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::AdvancedYearRound
    }

    fn history_points(&self, time: i64, _interval: u64) -> Vec<i64> {
        days_back(time, self.0.floor_interval.max(self.0.ceil_interval)).collect()
    }

    fn detect(&self, input: &DetectInput<'_>) -> DetectResult<Option<String>> {
        let cfg = self.0;
        let rising = Bounds {
            floor: None,
            ceil: cfg.ceil,
        };
        let falling = Bounds {
            floor: cfg.floor,
            ceil: None,
        };
        let label = |n: u32| format!("mean of the last {n} days");
        let ceil_hit = mean_at(input.history, days_back(input.time, cfg.ceil_interval))
            .and_then(|r| rising.check(input.value, r, &label(cfg.ceil_interval)));
        if ceil_hit.is_some() {
            return Ok(ceil_hit);
        }
        Ok(mean_at(input.history, days_back(input.time, cfg.floor_interval))
            .and_then(|r| falling.check(input.value, r, &label(cfg.floor_interval))))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const NOW: i64 = 10 * DAY_SECS + 3600;

    fn input<'a>(value: f64, history: &'a HashMap<i64, f64>) -> DetectInput<'a> {
        DetectInput {
            value,
            time: NOW,
            interval: 60,
            history,
            peers: &[],
        }
    }

    #[test]
    fn simple_compares_yesterday() {
        let detector = SimpleYearRound(Bounds {
            floor: None,
            ceil: Some(20.0),
        });
        assert_eq!(detector.history_points(NOW, 60), vec![NOW - DAY_SECS]);
        let history = HashMap::from([(NOW - DAY_SECS, 100.0)]);
        assert!(detector.detect(&input(130.0, &history)).unwrap().is_some());
        assert!(detector.detect(&input(110.0, &history)).unwrap().is_none());
    }

    #[test]
    fn advanced_averages_available_days() {
        let detector = AdvancedYearRound(AdvancedYearRoundConfig {
            floor: Some(50.0),
            ceil: None,
            floor_interval: 3,
            ceil_interval: 3,
        });
        assert_eq!(detector.history_points(NOW, 60).len(), 3);
        // day 2 missing: mean of 100 and 200
        let history = HashMap::from([(NOW - DAY_SECS, 100.0), (NOW - 3 * DAY_SECS, 200.0)]);
        assert!(detector.detect(&input(70.0, &history)).unwrap().is_some());
        assert!(detector.detect(&input(80.0, &history)).unwrap().is_none());
    }
}
