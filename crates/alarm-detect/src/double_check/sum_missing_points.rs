use std::collections::BTreeSet;

use alarm_core::{AlgorithmKind, Anomaly, StrategyId};

use super::{CheckContext, DoubleCheckGate, DoubleCheckStrategy, Verdict, RESULT_TAG};

pub const SUSPECTED_MISSING_POINTS: &str = "SUSPECTED_MISSING_POINTS";

/// A SUM over a window that lost part of its input points drops sharply
/// even though nothing happened. Such anomalies are tagged instead of
/// dropped so downstream can tell them apart.
pub struct SumFunctionByMissingPoints {
    gate: DoubleCheckGate,
}

impl SumFunctionByMissingPoints {
    pub fn new(strategy_ids: impl IntoIterator<Item = StrategyId>) -> Self {
        Self {
            gate: DoubleCheckGate {
                name: "SumFunctionByMissingPoints".to_string(),
                match_strategy_ids: strategy_ids.into_iter().collect::<BTreeSet<_>>(),
                data_scopes: vec![("bk_monitor".to_string(), "time_series".to_string())],
                match_agg_method: Some("SUM".to_string()),
                match_algorithms_type_sequence: vec![
                    AlgorithmKind::Threshold,
                    AlgorithmKind::SimpleRingRatio,
                    AlgorithmKind::AdvancedRingRatio,
                ],
            },
        }
    }
}

impl DoubleCheckStrategy for SumFunctionByMissingPoints {
    fn gate(&self) -> &DoubleCheckGate {
        &self.gate
    }

    fn double_check(&self, ctx: &CheckContext<'_>, anomalies: &mut Vec<Anomaly>) -> Verdict {
        if anomalies.is_empty() {
            return Verdict::Passed;
        }
        let Some(previous) = ctx.previous_value() else {
            return Verdict::Passed;
        };
        if previous <= 0.0 || ctx.value >= previous * 0.5 {
            return Verdict::Passed;
        }
        for anomaly in anomalies.iter_mut() {
            anomaly
                .tags
                .insert(RESULT_TAG.to_string(), SUSPECTED_MISSING_POINTS.to_string());
        }
        Verdict::Suspected
    }
}
