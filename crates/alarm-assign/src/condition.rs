//! Subscription conditions.
//!
//! A rule's conditions read left to right; `composite: "or"` starts a
//! new group and the rule matches when every condition of some group
//! matches:
//!
//! ```text
//! [a and b] or [c] or [d and e]
//! ```
//!
//! Every field resolves to a list of strings on the alert. A missing
//! field reads as `[""]`; a `*_topo_node` field on an alert whose
//! topology was never resolved fails the condition.

use std::collections::BTreeSet;

use alarm_core::Alert;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{AssignError, AssignResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Composite {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Eq,
    Neq,
    Include,
    Exclude,
    Gt,
    Gte,
    Lt,
    Lte,
    Reg,
    Nreg,
    Issuperset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub method: Method,
    #[serde(default, deserialize_with = "target_values")]
    pub value: Vec<String>,
    #[serde(default, alias = "condition")]
    pub composite: Composite,
}

impl Condition {
    pub fn new(field: &str, method: Method, value: &[&str]) -> Self {
        Self {
            field: field.to_string(),
            method,
            value: value.iter().map(|v| v.to_string()).collect(),
            composite: Composite::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.composite = Composite::Or;
        self
    }
}

fn target_values<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    let raw = Value::deserialize(de)?;
    Ok(match raw {
        Value::Null => Vec::new(),
        Value::Array(values) => values.iter().filter_map(target_string).collect(),
        other => target_string(&other).into_iter().collect(),
    })
}

/// Scalars as text, CMDB nodes `{bk_obj_id, bk_inst_id}` as
/// `obj|inst`, hosts `{ip, ...}` as their ip.
pub fn target_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => {
            if let Some(ip) = map.get("ip").or_else(|| map.get("bk_target_ip")) {
                return target_string(ip);
            }
            let obj = map.get("bk_obj_id").and_then(target_string)?;
            let inst = map.get("bk_inst_id").and_then(target_string)?;
            Some(format!("{obj}|{inst}"))
        }
        _ => None,
    }
}

// ── Field resolution ───────────────────────────────────────────

fn first_dimension(alert: &Alert, names: &[&str]) -> Vec<String> {
    let found = names.iter().find_map(|n| alert.dimensions.get(*n));
    vec![found.cloned().unwrap_or_default()]
}

/// Values of `field` on `alert`; `None` when the field needs topology the
/// alert does not carry.
pub fn field_values(alert: &Alert, field: &str) -> Option<Vec<String>> {
    let values = match field {
        "ip" | "bk_target_ip" => first_dimension(alert, &["bk_target_ip", "ip"]),
        "service_instance_id" | "bk_target_service_instance_id" => first_dimension(
            alert,
            &["bk_target_service_instance_id", "service_instance_id"],
        ),
        f if f.ends_with("_topo_node") => return alert.topo_nodes.clone(),
        "labels" => alert.labels.clone(),
        "data_source_label" => alert.data_source_labels.clone(),
        "bk_biz_id" => vec![alert.bk_biz_id.to_string()],
        "strategy_id" => vec![alert.strategy_id.to_string()],
        "alert_name" | "alert.name" => vec![alert.alert_name.clone()],
        "severity" | "level" => vec![alert.severity.to_string()],
        other => first_dimension(alert, &[other]),
    };
    Some(values)
}

// ── Compiled form ──────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CompiledCondition {
    condition: Condition,
    patterns: Vec<Regex>,
}

impl CompiledCondition {
    fn compile(condition: &Condition) -> AssignResult<Self> {
        let patterns = match condition.method {
            Method::Reg | Method::Nreg => condition
                .value
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| AssignError::Condition {
                        field: condition.field.clone(),
                        reason: e.to_string(),
                    })
                })
                .collect::<AssignResult<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Self {
            condition: condition.clone(),
            patterns,
        })
    }

    fn matches(&self, alert: &Alert) -> bool {
        let Some(actual) = field_values(alert, &self.condition.field) else {
            return false;
        };
        let expected = &self.condition.value;
        let any_equal = || actual.iter().any(|a| expected.contains(a));
        let any_contains = || {
            actual
                .iter()
                .any(|a| expected.iter().any(|e| a.contains(e.as_str())))
        };
        let any_regex = || {
            actual
                .iter()
                .any(|a| self.patterns.iter().any(|p| p.is_match(a)))
        };
        match self.condition.method {
            Method::Eq => any_equal(),
            Method::Neq => !any_equal(),
            Method::Include => any_contains(),
            Method::Exclude => !any_contains(),
            Method::Reg => any_regex(),
            Method::Nreg => !any_regex(),
            Method::Issuperset => {
                let have: BTreeSet<&str> = actual.iter().map(String::as_str).collect();
                expected.iter().all(|e| have.contains(e.as_str()))
            }
            Method::Gt => compare(&actual, expected, |a, e| a > e),
            Method::Gte => compare(&actual, expected, |a, e| a >= e),
            Method::Lt => compare(&actual, expected, |a, e| a < e),
            Method::Lte => compare(&actual, expected, |a, e| a <= e),
        }
    }
}

fn compare(actual: &[String], expected: &[String], op: impl Fn(f64, f64) -> bool) -> bool {
    let numbers = |values: &[String]| -> Vec<f64> {
        values.iter().filter_map(|v| v.trim().parse().ok()).collect()
    };
    let expected = numbers(expected);
    numbers(actual)
        .into_iter()
        .any(|a| expected.iter().any(|e| op(a, *e)))
}

/// Conditions grouped for evaluation. An empty list matches every alert.
#[derive(Debug, Clone, Default)]
pub struct ConditionGroups {
    groups: Vec<Vec<CompiledCondition>>,
}

impl ConditionGroups {
    pub fn compile(conditions: &[Condition]) -> AssignResult<Self> {
        let mut groups: Vec<Vec<CompiledCondition>> = Vec::new();
        for (i, condition) in conditions.iter().enumerate() {
            let compiled = CompiledCondition::compile(condition)?;
            let starts_group = i == 0 || condition.composite == Composite::Or;
            match groups.last_mut() {
                Some(group) if !starts_group => group.push(compiled),
                _ => groups.push(vec![compiled]),
            }
        }
        Ok(Self { groups })
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn is_match(&self, alert: &Alert) -> bool {
        self.groups.is_empty()
            || self
                .groups
                .iter()
                .any(|group| group.iter().all(|c| c.matches(alert)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use alarm_core::Level;
    use serde_json::json;

    use super::*;

    fn alert(dims: &[(&str, &str)]) -> Alert {
        Alert {
            bk_biz_id: 2,
            strategy_id: 1,
            alert_name: "CPU usage high".to_string(),
            severity: Level::Fatal,
            dimensions: dims
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            labels: vec!["os".to_string(), "linux".to_string()],
            ..Default::default()
        }
    }

    fn matches(conditions: &[Condition], alert: &Alert) -> bool {
        ConditionGroups::compile(conditions).unwrap().is_match(alert)
    }

    #[test]
    fn eq_and_neq_use_intersection() {
        let a = alert(&[("bcs_cluster_id", "C1")]);
        assert!(matches(&[Condition::new("bcs_cluster_id", Method::Eq, &["C0", "C1"])], &a));
        assert!(!matches(&[Condition::new("bcs_cluster_id", Method::Neq, &["C1"])], &a));
        assert!(matches(&[Condition::new("bcs_cluster_id", Method::Neq, &["C2"])], &a));
    }

    #[test]
    fn missing_field_reads_as_empty_string() {
        let a = alert(&[]);
        assert!(matches(&[Condition::new("namespace", Method::Eq, &[""])], &a));
        assert!(!matches(&[Condition::new("namespace", Method::Eq, &["prod"])], &a));
    }

    #[test]
    fn or_starts_a_new_group() {
        let a = alert(&[("env", "prod"), ("app", "web")]);
        let rule = [
            Condition::new("env", Method::Eq, &["test"]),
            Condition::new("app", Method::Eq, &["web"]),
            Condition::new("env", Method::Eq, &["prod"]).or(),
        ];
        assert!(matches(&rule, &a));

        let rule = [
            Condition::new("env", Method::Eq, &["prod"]),
            Condition::new("app", Method::Eq, &["db"]),
        ];
        assert!(!matches(&rule, &a));
    }

    #[test]
    fn string_and_numeric_methods() {
        let a = alert(&[("path", "/data/logs"), ("disk", "87.5")]);
        assert!(matches(&[Condition::new("path", Method::Include, &["logs"])], &a));
        assert!(matches(&[Condition::new("path", Method::Exclude, &["tmp"])], &a));
        assert!(matches(&[Condition::new("disk", Method::Gt, &["80"])], &a));
        assert!(!matches(&[Condition::new("disk", Method::Lte, &["80"])], &a));
        assert!(!matches(&[Condition::new("path", Method::Gt, &["1"])], &a));
        assert!(matches(&[Condition::new("path", Method::Reg, &["^/data/"])], &a));
        assert!(matches(&[Condition::new("path", Method::Nreg, &["^/tmp"])], &a));
    }

    #[test]
    fn issuperset_over_labels() {
        let a = alert(&[]);
        assert!(matches(&[Condition::new("labels", Method::Issuperset, &["linux"])], &a));
        assert!(!matches(
            &[Condition::new("labels", Method::Issuperset, &["linux", "db"])],
            &a
        ));
    }

    #[test]
    fn ip_field_aliases() {
        let a = alert(&[("bk_target_ip", "10.0.0.1")]);
        assert!(matches(&[Condition::new("ip", Method::Eq, &["10.0.0.1"])], &a));
        let a = alert(&[("ip", "10.0.0.2")]);
        assert!(matches(&[Condition::new("bk_target_ip", Method::Eq, &["10.0.0.2"])], &a));
    }

    #[test]
    fn topo_conditions_need_topology() {
        let condition: Condition = serde_json::from_value(json!({
            "field": "host_topo_node",
            "method": "eq",
            "value": [{ "bk_obj_id": "set", "bk_inst_id": 5 }],
        }))
        .unwrap();
        assert_eq!(condition.value, vec!["set|5"]);

        let mut a = alert(&[]);
        assert!(!matches(std::slice::from_ref(&condition), &a));
        a.topo_nodes = Some(vec!["biz|2".to_string(), "set|5".to_string()]);
        assert!(matches(std::slice::from_ref(&condition), &a));
        a.topo_nodes = Some(vec!["set|6".to_string()]);
        assert!(!matches(&[condition], &a));
    }

    #[test]
    fn values_accept_scalars_and_hosts() {
        let condition: Condition = serde_json::from_value(json!({
            "field": "ip", "method": "eq",
            "value": [{ "ip": "10.0.0.1", "bk_cloud_id": 0 }, 42],
            "condition": "or",
        }))
        .unwrap();
        assert_eq!(condition.value, vec!["10.0.0.1", "42"]);
        assert_eq!(condition.composite, Composite::Or);
    }

    #[test]
    fn empty_rule_matches_everything() {
        assert!(matches(&[], &alert(&[])));
    }

    #[test]
    fn invalid_regex_fails_compile() {
        let err = ConditionGroups::compile(&[Condition::new("path", Method::Reg, &["("])]).unwrap_err();
        assert!(matches!(err, AssignError::Condition { .. }));
    }
}
