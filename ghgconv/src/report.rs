//! Non-fatal outcomes of a conversion run, collected for operator review.

use serde::{Deserialize, Serialize};

use crate::observation::{Key, Value};

/// A comparison between a derived total and an independently reported total for the same key.
/// The reported value is what remains in the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(flatten)]
    pub key: Key,
    /// The independently reported value (expected).
    pub reported: f64,
    /// The value derived by aggregation (actual).
    pub derived: f64,
    /// `reported - derived`
    pub discrepancy: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DownscaleIssue {
    /// No time point has the basket together with subcategory detail adding up to it.
    NoReferenceRatio,
    /// Known subcategories do not sum to the basket within tolerance.
    SumMismatch {
        time: i32,
        basket_value: f64,
        sum: f64,
    },
    /// Some but not all subcategories are present; the time point is left as reported.
    PartialDetail { time: i32 },
}

/// A downscale rule that was not (fully) applied to one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownscaleWarning {
    /// The basket series, with `time` set to the first affected year.
    pub series: Key,
    pub basket: String,
    #[serde(flatten)]
    pub issue: DownscaleIssue,
}

/// Two derivations produced different values for the same key. The existing value was kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    #[serde(flatten)]
    pub key: Key,
    pub stage: String,
    pub kept: Value,
    pub discarded: Value,
}

/// A row a stage could not use, e.g. because its unit cannot be converted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skipped {
    #[serde(flatten)]
    pub key: Key,
    pub stage: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub downscale_warnings: Vec<DownscaleWarning>,
    pub conflicts: Vec<Conflict>,
    pub skipped: Vec<Skipped>,
}

impl Report {
    /// Consistency checks that exceeded their tolerance.
    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.passed)
    }

    /// True when nothing needs operator attention.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
            && self.downscale_warnings.is_empty()
            && self.conflicts.is_empty()
            && self.skipped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::observation::tests::key;

    use super::*;

    #[test]
    fn report_serializes_flat_rows() -> anyhow::Result<()> {
        let report = Report {
            downscale_warnings: vec![DownscaleWarning {
                series: key("1.A", "CO2", 2000),
                basket: "1.A".into(),
                issue: DownscaleIssue::NoReferenceRatio,
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&report)?;
        assert_eq!(
            json["downscale_warnings"][0]["reason"],
            serde_json::json!("no_reference_ratio")
        );
        assert!(!report.is_clean());
        assert_eq!(serde_json::from_value::<Report>(json)?, report);
        Ok(())
    }

    #[test]
    fn passing_findings_keep_report_clean() {
        let report = Report {
            findings: vec![Finding {
                key: key("M.0.EL", "CO2", 2000),
                reported: 100.0,
                derived: 100.5,
                discrepancy: -0.5,
                passed: true,
            }],
            ..Default::default()
        };
        assert!(report.is_clean());
        assert_eq!(report.failures().count(), 0);
    }
}
