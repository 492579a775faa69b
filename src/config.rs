//! Tally configuration: the quarantine rule set and the special ballot list.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::quarantine::{Comparison, QuarantineCheck, QuarantineMetric};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub quarantine_checks: Vec<QuarantineCheck>,
    /// Ballots whose results are exported on their own. `None` exports all.
    #[serde(default)]
    pub special_ballots: Option<Vec<u32>>,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            quarantine_checks: vec![
                QuarantineCheck::new(
                    "Trigger 1 - Guard against overvoting",
                    QuarantineMetric::Overvote,
                    Comparison::GreaterThan,
                    10,
                )
                .set_order(1),
                QuarantineCheck::new(
                    "Trigger 2 - Guard against errors and tampering with the form",
                    QuarantineMetric::BallotVariance,
                    Comparison::GreaterThan,
                    20,
                )
                .set_order(2),
            ],
            special_ballots: None,
        }
    }
}

impl TallyConfig {
    pub fn from_json_str(contents: &str) -> anyhow::Result<Self> {
        serde_json::from_str(contents).context("Failed to parse tally configuration")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tally configuration {}", path.display()))?;
        Self::from_json_str(&contents)
    }

    pub fn is_special_ballot(&self, ballot_id: u32) -> bool {
        match &self.special_ballots {
            Some(ballots) => ballots.contains(&ballot_id),
            None => true,
        }
    }
}
