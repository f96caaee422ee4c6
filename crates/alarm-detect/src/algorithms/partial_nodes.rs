//! Partial nodes: fire when enough series of the item breach together.

use alarm_core::AlgorithmKind;
use serde_json::Value;

use super::{DetectInput, Detector, Threshold};
use crate::error::{DetectError, DetectResult};

#[derive(Debug, Clone, PartialEq)]
pub struct PartialNodes {
    count: usize,
    threshold: Threshold,
}

impl PartialNodes {
    /// `{"count": 2, "threshold": [[{"method": "gte", "threshold": 90}]]}`
    pub fn from_config(config: &Value) -> DetectResult<Self> {
        let count = config
            .get("count")
            .and_then(Value::as_u64)
            .filter(|c| *c > 0)
            .ok_or_else(|| DetectError::config("PartialNodes", "count must be a positive integer"))?;
        let threshold = config
            .get("threshold")
            .ok_or_else(|| DetectError::config("PartialNodes", "missing threshold"))
            .and_then(Threshold::from_config)?;
        Ok(Self {
            count: count as usize,
            threshold,
        })
    }
}

impl Detector for PartialNodes {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::PartialNodes
    }

    fn detect(&self, input: &DetectInput<'_>) -> DetectResult<Option<String>> {
        let Some(rule) = self.threshold.matching_group(input.value) else {
            return Ok(None);
        };
        let breaching = input
            .peers
            .iter()
            .filter(|v| self.threshold.matching_group(**v).is_some())
            .count();
        Ok((breaching >= self.count).then(|| {
            format!(
                "{breaching} series {rule} (at least {} required), current value {}",
                self.count, input.value
            )
        }))
    }
}
