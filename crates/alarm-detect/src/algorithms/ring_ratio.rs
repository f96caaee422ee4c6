//! Ring ratio: change against the preceding points of the same series.

use alarm_core::AlgorithmKind;
use serde::Deserialize;

use super::{mean_at, Bounds, DetectInput, Detector};
use crate::error::DetectResult;

/// Compare with the point one interval earlier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpleRingRatio(pub Bounds);

impl Detector for SimpleRingRatio {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::SimpleRingRatio
    }

    fn history_points(&self, time: i64, interval: u64) -> Vec<i64> {
        vec![time - interval as i64]
    }

    fn detect(&self, input: &DetectInput<'_>) -> DetectResult<Option<String>> {
        let previous = input.time - input.interval as i64;
        Ok(input
            .history
            .get(&previous)
            .and_then(|reference| self.0.check(input.value, *reference, "previous point")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AdvancedRingRatioConfig {
    #[serde(default)]
    pub floor: Option<f64>,
    #[serde(default)]
    pub ceil: Option<f64>,
    #[serde(default = "default_points")]
    pub floor_interval: u32,
    #[serde(default = "default_points")]
    pub ceil_interval: u32,
}

fn default_points() -> u32 {
    1
}

/// Compare with the mean of the last `floor_interval` / `ceil_interval`
/// points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvancedRingRatio(pub AdvancedRingRatioConfig);

impl AdvancedRingRatio {
    fn window(time: i64, interval: u64, points: u32) -> impl Iterator<Item = i64> {
        (1..=points as i64).map(move |k| time - k * interval as i64)
    }
}

impl Detector for AdvancedRingRatio {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::AdvancedRingRatio
    }

    fn history_points(&self, time: i64, interval: u64) -> Vec<i64> {
        let points = self.0.floor_interval.max(self.0.ceil_interval);
        Self::window(time, interval, points).collect()
    }

    fn detect(&self, input: &DetectInput<'_>) -> DetectResult<Option<String>> {
        let cfg = self.0;
        let ceil_ref = mean_at(input.history, Self::window(input.time, input.interval, cfg.ceil_interval));
        let floor_ref = mean_at(input.history, Self::window(input.time, input.interval, cfg.floor_interval));

        let rising = Bounds {
            floor: None,
            ceil: cfg.ceil,
        };
        let falling = Bounds {
            floor: cfg.floor,
            ceil: None,
        };
        let label = |n: u32| format!("mean of last {n} points");
        Ok(ceil_ref
            .and_then(|r| rising.check(input.value, r, &label(cfg.ceil_interval)))
            .or_else(|| floor_ref.and_then(|r| falling.check(input.value, r, &label(cfg.floor_interval)))))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn input<'a>(value: f64, history: &'a HashMap<i64, f64>) -> DetectInput<'a> {
        DetectInput {
            value,
            time: 600,
            interval: 60,
            history,
            peers: &[],
        }
    }

    #[test]
    fn simple_compares_previous_point() {
        let detector = SimpleRingRatio(Bounds {
            floor: Some(50.0),
            ceil: Some(50.0),
        });
        assert_eq!(detector.history_points(600, 60), vec![540]);

        let history = HashMap::from([(540, 10.0)]);
        assert!(detector.detect(&input(16.0, &history)).unwrap().is_some());
        assert!(detector.detect(&input(12.0, &history)).unwrap().is_none());
        assert!(detector.detect(&input(4.0, &history)).unwrap().is_some());
    }

    #[test]
    fn simple_without_previous_point_is_normal() {
        let detector = SimpleRingRatio(Bounds {
            floor: None,
            ceil: Some(1.0),
        });
        let history = HashMap::new();
        assert!(detector.detect(&input(100.0, &history)).unwrap().is_none());
    }

    #[test]
    fn advanced_uses_window_means() {
        let detector = AdvancedRingRatio(AdvancedRingRatioConfig {
            floor: Some(50.0),
            ceil: Some(100.0),
            floor_interval: 1,
            ceil_interval: 3,
        });
        assert_eq!(detector.history_points(600, 60), vec![540, 480, 420]);

        // ceil mean = 10, floor reference = last point = 30
        let history = HashMap::from([(540, 30.0), (480, 0.0), (420, 0.0)]);
        assert!(detector.detect(&input(20.0, &history)).unwrap().is_some());
        assert!(detector.detect(&input(16.0, &history)).unwrap().is_none());
        assert!(detector.detect(&input(14.0, &history)).unwrap().is_some());
    }
}
