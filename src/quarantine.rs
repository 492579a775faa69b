//! Quarantine evaluator: numeric trigger rules over a form's reconciliation.
//!
//! Evaluation is a pure function of the rule set and the metrics. Every check
//! is evaluated; nothing short-circuits, and all fired checks are reported.
use log::debug;
use serde::{Deserialize, Serialize};

use super::records::ReconciliationData;

/// The figure a check compares against its threshold.
#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineMetric {
    /// |expected - counted| in ballots
    #[n(0)]
    BallotVariance,
    /// |expected - counted| in basis points of expected
    #[n(1)]
    RelativeVariance,
    /// ballots counted beyond the station's registrants
    #[n(2)]
    Overvote,
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
pub enum Comparison {
    #[n(0)]
    #[serde(rename = ">")]
    GreaterThan,
    #[n(1)]
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[n(2)]
    #[serde(rename = "<")]
    LessThan,
    #[n(3)]
    #[serde(rename = "<=")]
    LessOrEqual,
    #[n(4)]
    #[serde(rename = "==")]
    Equal,
    #[n(5)]
    #[serde(rename = "!=")]
    NotEqual,
}

impl Comparison {
    pub fn holds(&self, lhs: u64, rhs: u64) -> bool {
        match self {
            Comparison::GreaterThan => lhs > rhs,
            Comparison::GreaterOrEqual => lhs >= rhs,
            Comparison::LessThan => lhs < rhs,
            Comparison::LessOrEqual => lhs <= rhs,
            Comparison::Equal => lhs == rhs,
            Comparison::NotEqual => lhs != rhs,
        }
    }
}

/// A named, ordered rule `metric OP value`. Immutable once stored.
#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq,
)]
pub struct QuarantineCheck {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub method: QuarantineMetric,
    #[n(2)]
    pub comparison: Comparison,
    #[n(3)]
    pub value: u64,
    #[n(4)]
    #[serde(default)]
    pub order: u32,
    #[n(5)]
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl QuarantineCheck {
    pub fn new(name: &str, method: QuarantineMetric, comparison: Comparison, value: u64) -> Self {
        Self {
            name: name.to_string(),
            method,
            comparison,
            value,
            order: 0,
            active: true,
        }
    }
    pub fn set_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// Whether this check fires for `metrics`. A zero metric never fires.
    pub fn fires(&self, metrics: &ReconciliationMetrics) -> bool {
        let observed = metrics.value(self.method);
        observed != 0 && self.comparison.holds(observed, self.value)
    }
}

/// Figures the checks are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconciliationMetrics {
    pub ballots_expected: u64,
    pub ballots_counted: u64,
    pub registrants: Option<u64>,
}

impl ReconciliationMetrics {
    pub fn from_reconciliation(data: &ReconciliationData, registrants: Option<u64>) -> Self {
        Self {
            ballots_expected: data.number_ballots_expected,
            ballots_counted: data.ballots_counted(),
            registrants,
        }
    }

    pub fn variance(&self) -> u64 {
        self.ballots_expected.abs_diff(self.ballots_counted)
    }

    pub fn value(&self, metric: QuarantineMetric) -> u64 {
        match metric {
            QuarantineMetric::BallotVariance => self.variance(),
            QuarantineMetric::RelativeVariance => {
                let variance = self.variance();
                if variance == 0 {
                    0
                } else if self.ballots_expected == 0 {
                    u64::MAX
                } else {
                    variance.saturating_mul(10_000) / self.ballots_expected
                }
            }
            QuarantineMetric::Overvote => self
                .registrants
                .map(|r| self.ballots_counted.saturating_sub(r))
                .unwrap_or(0),
        }
    }
}

/// Names of every active check that fires, in check order.
pub fn evaluate(checks: &[QuarantineCheck], metrics: &ReconciliationMetrics) -> Vec<String> {
    let mut ordered: Vec<&QuarantineCheck> = checks.iter().filter(|c| c.active).collect();
    ordered.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));

    let fired: Vec<String> = ordered
        .into_iter()
        .filter(|check| check.fires(metrics))
        .map(|check| check.name.clone())
        .collect();

    debug!(
        "quarantine evaluation: expected={} counted={} fired={:?}",
        metrics.ballots_expected, metrics.ballots_counted, fired
    );
    fired
}
