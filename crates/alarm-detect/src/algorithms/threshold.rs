//! Static threshold: OR over groups, AND within a group.
//!
//! ```text
//! [[{"method": "gte", "threshold": 80}, {"method": "lt", "threshold": 95}],
//!  [{"method": "eq",  "threshold": 0}]]
//! ```

use alarm_core::AlgorithmKind;
use serde::Deserialize;
use serde_json::Value;

use super::{DetectInput, Detector};
use crate::error::{DetectError, DetectResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Gte => value >= threshold,
            Comparison::Lt => value < threshold,
            Comparison::Lte => value <= threshold,
            Comparison::Eq => value == threshold,
            Comparison::Neq => value != threshold,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
            Comparison::Eq => "=",
            Comparison::Neq => "!=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Condition {
    method: Comparison,
    threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    groups: Vec<Vec<Condition>>,
}

impl Threshold {
    /// Accepts a list of AND groups, or a single flat group.
    pub fn from_config(config: &Value) -> DetectResult<Self> {
        let invalid = |reason: String| DetectError::config("Threshold", reason);
        let Value::Array(outer) = config else {
            return Err(invalid(format!("expected a list, got {config}")));
        };
        let raw_groups: Vec<&Value> = if outer.first().is_some_and(Value::is_object) {
            vec![config]
        } else {
            outer.iter().collect()
        };

        let mut groups = Vec::with_capacity(raw_groups.len());
        for group in raw_groups {
            let Value::Array(conditions) = group else {
                return Err(invalid(format!("group must be a list, got {group}")));
            };
            let mut parsed = Vec::with_capacity(conditions.len());
            for condition in conditions {
                let method: Comparison = condition
                    .get("method")
                    .cloned()
                    .ok_or_else(|| invalid("condition without method".to_string()))
                    .and_then(|m| serde_json::from_value(m).map_err(|e| invalid(e.to_string())))?;
                let threshold = match condition.get("threshold") {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::String(s)) => s.trim().parse().ok(),
                    _ => None,
                }
                .ok_or_else(|| invalid(format!("bad threshold in {condition}")))?;
                parsed.push(Condition { method, threshold });
            }
            if !parsed.is_empty() {
                groups.push(parsed);
            }
        }
        if groups.is_empty() {
            return Err(invalid("no conditions".to_string()));
        }
        Ok(Self { groups })
    }

    /// The first group `value` satisfies, rendered.
    pub fn matching_group(&self, value: f64) -> Option<String> {
        self.groups
            .iter()
            .find(|group| group.iter().all(|c| c.method.holds(value, c.threshold)))
            .map(|group| {
                group
                    .iter()
                    .map(|c| format!("{} {}", c.method.symbol(), c.threshold))
                    .collect::<Vec<_>>()
                    .join(" and ")
            })
    }
}

impl Detector for Threshold {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Threshold
    }

    fn detect(&self, input: &DetectInput<'_>) -> DetectResult<Option<String>> {
        Ok(self
            .matching_group(input.value)
            .map(|rule| format!("current value {} {rule}", input.value)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    fn run(threshold: &Threshold, value: f64) -> Option<String> {
        let history = HashMap::new();
        threshold
            .detect(&DetectInput {
                value,
                time: 60,
                interval: 60,
                history: &history,
                peers: &[],
            })
            .unwrap()
    }

    #[test]
    fn or_of_and_groups() {
        let t = Threshold::from_config(&json!([
            [{ "method": "gte", "threshold": 80 }, { "method": "lt", "threshold": "95" }],
            [{ "method": "eq", "threshold": 0 }]
        ]))
        .unwrap();
        assert_eq!(run(&t, 90.0).as_deref(), Some("current value 90 >= 80 and < 95"));
        assert!(run(&t, 96.0).is_none());
        assert!(run(&t, 0.0).is_some());
        assert!(run(&t, 50.0).is_none());
    }

    #[test]
    fn flat_list_is_one_group() {
        let t = Threshold::from_config(&json!([{ "method": "gt", "threshold": 1 }])).unwrap();
        assert!(run(&t, 2.0).is_some());
        assert!(run(&t, 1.0).is_none());
    }

    #[test]
    fn invalid_configs() {
        for config in [
            json!({}),
            json!([]),
            json!([[{ "method": "between", "threshold": 1 }]]),
            json!([[{ "method": "gt" }]]),
            json!([[{ "threshold": 1 }]]),
        ] {
            assert!(Threshold::from_config(&config).is_err(), "{config}");
        }
    }
}
