//! Secondary validation of freshly detected anomalies.
//!
//! A double-check strategy declares which items it applies to through a
//! [`DoubleCheckGate`]; the registry hands each item to the first
//! registered strategy whose gate it passes. The strategy may drop or
//! annotate the anomalies of that point before they are emitted.

mod sum_missing_points;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use alarm_core::config::DoubleCheckSettings;
use alarm_core::{AlgorithmKind, Anomaly, Item, StrategyId};

pub use sum_missing_points::{SumFunctionByMissingPoints, SUSPECTED_MISSING_POINTS};

/// Tag key set on anomalies a checker annotated.
pub const RESULT_TAG: &str = "__double_check_result";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DoubleCheckGate {
    pub name: String,
    /// Empty disables the strategy.
    pub match_strategy_ids: BTreeSet<StrategyId>,
    pub data_scopes: Vec<(String, String)>,
    pub match_agg_method: Option<String>,
    /// Preference order; the first one the item carries is the target.
    pub match_algorithms_type_sequence: Vec<AlgorithmKind>,
}

impl DoubleCheckGate {
    pub fn check_hit(&self, strategy_id: StrategyId, item: &Item) -> bool {
        if !self.match_strategy_ids.contains(&strategy_id) {
            return false;
        }
        let scope_hit = item.data_scopes().any(|(source, kind)| {
            self.data_scopes
                .iter()
                .any(|(s, k)| s == source && k == kind)
        });
        if !scope_hit {
            return false;
        }
        if let Some(method) = &self.match_agg_method {
            if !item.agg_methods.contains(method) {
                return false;
            }
        }
        self.get_best_match_algorithm(item).is_some()
    }

    pub fn get_best_match_algorithm(&self, item: &Item) -> Option<AlgorithmKind> {
        self.match_algorithms_type_sequence
            .iter()
            .copied()
            .find(|kind| item.has_algorithm(*kind))
    }
}

/// What a checker sees for one point.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub item: &'a Item,
    pub target: AlgorithmKind,
    pub value: f64,
    pub time: i64,
    /// Includes the point one interval earlier when it was recorded.
    pub history: &'a HashMap<i64, f64>,
}

impl CheckContext<'_> {
    pub fn previous_value(&self) -> Option<f64> {
        self.history
            .get(&(self.time - self.item.interval as i64))
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Suspected,
    Dropped,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Passed => "passed",
            Verdict::Suspected => "suspected",
            Verdict::Dropped => "dropped",
        }
    }
}

pub trait DoubleCheckStrategy: Send + Sync {
    fn gate(&self) -> &DoubleCheckGate;

    fn double_check(&self, ctx: &CheckContext<'_>, anomalies: &mut Vec<Anomaly>) -> Verdict;
}

#[derive(Default, Clone)]
pub struct DoubleCheckRegistry {
    strategies: Vec<Arc<dyn DoubleCheckStrategy>>,
}

impl DoubleCheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in strategy, configured from `settings`.
    pub fn builtin(settings: &DoubleCheckSettings) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SumFunctionByMissingPoints::new(
            settings.sum_strategy_ids.iter().copied(),
        )));
        registry
    }

    pub fn register(&mut self, strategy: Arc<dyn DoubleCheckStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// First registered strategy whose gate `item` passes.
    pub fn find(&self, strategy_id: StrategyId, item: &Item) -> Option<&dyn DoubleCheckStrategy> {
        self.strategies
            .iter()
            .find(|s| s.gate().check_hit(strategy_id, item))
            .map(|s| s.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Veto(DoubleCheckGate);

    impl DoubleCheckStrategy for Veto {
        fn gate(&self) -> &DoubleCheckGate {
            &self.0
        }

        fn double_check(&self, _ctx: &CheckContext<'_>, anomalies: &mut Vec<Anomaly>) -> Verdict {
            anomalies.clear();
            Verdict::Dropped
        }
    }

    fn gate_x() -> DoubleCheckGate {
        DoubleCheckGate {
            name: "X".to_string(),
            match_strategy_ids: BTreeSet::from([42]),
            data_scopes: vec![("bk_monitor".to_string(), "time_series".to_string())],
            match_agg_method: None,
            match_algorithms_type_sequence: vec![
                AlgorithmKind::Threshold,
                AlgorithmKind::SimpleRingRatio,
            ],
        }
    }

    fn ring_ratio_item() -> Item {
        serde_json::from_value(json!({
            "id": 421,
            "agg_methods": ["AVG"],
            "data_source_labels": ["bk_monitor"],
            "data_type_labels": ["time_series"],
            "algorithms": [{ "type": "SimpleRingRatio", "level": 2, "config": { "ceil": 10 } }],
        }))
        .unwrap()
    }

    #[test]
    fn gate_matches_whitelisted_strategy() {
        let gate = gate_x();
        let item = ring_ratio_item();
        assert!(gate.check_hit(42, &item));
        assert_eq!(
            gate.get_best_match_algorithm(&item),
            Some(AlgorithmKind::SimpleRingRatio)
        );
        assert!(!gate.check_hit(7, &item));
    }

    #[test]
    fn gate_checks_scope_agg_and_algorithms() {
        let mut item = ring_ratio_item();
        item.data_type_labels = BTreeSet::from(["event".to_string()]);
        assert!(!gate_x().check_hit(42, &item));

        let item = ring_ratio_item();
        let mut gate = gate_x();
        gate.match_agg_method = Some("SUM".to_string());
        assert!(!gate.check_hit(42, &item));

        let mut gate = gate_x();
        gate.match_algorithms_type_sequence = vec![AlgorithmKind::PartialNodes];
        assert!(!gate.check_hit(42, &item));

        let mut gate = gate_x();
        gate.match_strategy_ids.clear();
        assert!(!gate.check_hit(42, &item));
    }

    #[test]
    fn registry_picks_first_hit() {
        let mut registry = DoubleCheckRegistry::new();
        let mut first = gate_x();
        first.name = "first".to_string();
        let mut second = gate_x();
        second.name = "second".to_string();
        registry.register(Arc::new(Veto(first)));
        registry.register(Arc::new(Veto(second)));

        let item = ring_ratio_item();
        assert_eq!(registry.find(42, &item).unwrap().gate().name, "first");
        assert!(registry.find(7, &item).is_none());
    }

    #[test]
    fn builtin_is_disabled_without_ids() {
        let registry = DoubleCheckRegistry::builtin(&DoubleCheckSettings::default());
        assert_eq!(registry.len(), 1);
        assert!(registry.find(42, &ring_ratio_item()).is_none());
    }
}
