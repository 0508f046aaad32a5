//! Scoring metrics and metric resolution.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DistillError;

/// Identifier of a supported scoring metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    Accuracy,
    BalancedAccuracy,
}

impl MetricName {
    pub const ALL: [MetricName; 2] = [MetricName::Accuracy, MetricName::BalancedAccuracy];

    /// Short identifier used in configuration files.
    pub fn short_name(self) -> &'static str {
        match self {
            MetricName::Accuracy => "acc",
            MetricName::BalancedAccuracy => "bacc",
        }
    }

    fn expected_names() -> String {
        Self::ALL
            .iter()
            .map(|m| format!("{} ({})", m.short_name(), m))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricName::Accuracy => f.write_str("accuracy"),
            MetricName::BalancedAccuracy => f.write_str("balanced_accuracy"),
        }
    }
}

impl FromStr for MetricName {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acc" | "accuracy" => Ok(MetricName::Accuracy),
            "bacc" | "balanced_accuracy" => Ok(MetricName::BalancedAccuracy),
            _ => Err(DistillError::UnknownMetric {
                name: s.to_string(),
                expected: Self::expected_names(),
            }),
        }
    }
}

/// A resolved scoring function over label sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metric {
    name: MetricName,
}

impl Metric {
    pub fn resolve(name: MetricName) -> Self {
        Self { name }
    }

    /// Parse and resolve in one step. Unknown identifiers fail here.
    pub fn from_identifier(identifier: &str) -> Result<Self, DistillError> {
        identifier.parse().map(Self::resolve)
    }

    pub fn name(&self) -> MetricName {
        self.name
    }

    /// Score predictions against ground truth, in `[0, 1]`.
    pub fn score(&self, truth: &[usize], predicted: &[usize]) -> Result<f64, DistillError> {
        if truth.len() != predicted.len() {
            return Err(DistillError::metric_input(format!(
                "{} true labels but {} predictions",
                truth.len(),
                predicted.len()
            )));
        }
        if truth.is_empty() {
            return Ok(0.0);
        }
        Ok(match self.name {
            MetricName::Accuracy => accuracy(truth, predicted),
            MetricName::BalancedAccuracy => balanced_accuracy(truth, predicted),
        })
    }
}

fn accuracy(truth: &[usize], predicted: &[usize]) -> f64 {
    let correct = truth
        .iter()
        .zip(predicted.iter())
        .filter(|(t, p)| t == p)
        .count();
    correct as f64 / truth.len() as f64
}

/// Mean per-class recall over the classes present in `truth`.
fn balanced_accuracy(truth: &[usize], predicted: &[usize]) -> f64 {
    // class -> (support, hits)
    let mut per_class: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (t, p) in truth.iter().zip(predicted.iter()) {
        let entry = per_class.entry(*t).or_default();
        entry.0 += 1;
        if t == p {
            entry.1 += 1;
        }
    }
    let recall_sum: f64 = per_class
        .values()
        .map(|(support, hits)| *hits as f64 / *support as f64)
        .sum();
    recall_sum / per_class.len() as f64
}

/// Arithmetic mean; an empty slice has mean `0.0`.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
