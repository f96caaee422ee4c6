//! Prometheus text exposition format.
//!
//! Renders metric families into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use crate::collector::{MetricFamily, Sample};

/// Render metric families into Prometheus text format.
///
/// Families without samples still get their `# HELP` / `# TYPE` lines.
pub fn render_prometheus(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        out.push_str(&format!("# HELP {} {}\n", family.name, family.help));
        out.push_str(&format!("# TYPE {} {}\n", family.name, family.kind.as_str()));
        for sample in &family.samples {
            out.push_str(family.name);
            out.push_str(&render_labels(sample));
            out.push_str(&format!(" {}\n", format_value(sample.value)));
        }
    }
    out
}

fn render_labels(sample: &Sample) -> String {
    if sample.labels.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = sample
        .labels
        .iter()
        .map(|(name, value)| format!("{name}=\"{}\"", escape_label(value)))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
