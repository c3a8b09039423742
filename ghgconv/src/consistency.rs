//! Comparison of derived totals against independently reported totals.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::observation::{Key, ObservationTable, Value};
use crate::report::{Conflict, Finding, Report};

/// Allowed disagreement between two values. A pair passes when
/// `|a - b| <= max(absolute, relative * max(|a|, |b|))`, which is symmetric in its operands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub relative: f64,
    pub absolute: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            relative: 0.01,
            absolute: 0.0,
        }
    }
}

impl Tolerance {
    pub fn relative(relative: f64) -> Self {
        Self {
            relative,
            absolute: 0.0,
        }
    }

    pub fn within(&self, a: f64, b: f64) -> bool {
        let bound = self.absolute.max(self.relative * a.abs().max(b.abs()));
        (a - b).abs() <= bound
    }
}

/// Compares a derived value with the reported value at the same key. Failures are logged;
/// the caller keeps the reported value either way.
pub fn check(key: &Key, derived: f64, reported: f64, tolerance: &Tolerance) -> Finding {
    let passed = tolerance.within(derived, reported);
    let discrepancy = reported - derived;
    if !passed {
        warn!(
            "Consistency check failed for {key}: reported {reported}, derived {derived} \
             (discrepancy {discrepancy:+})"
        );
    }
    Finding {
        key: key.clone(),
        reported,
        derived,
        discrepancy,
        passed,
    }
}

/// Places a derived value at `key` without ever replacing an independently reported one.
///
/// A reported number is compared against the derived number and the finding recorded. A
/// reported marker that disagrees with the derivation is recorded as a conflict. Missing
/// reported values are filled.
pub(crate) fn reconcile(
    table: &mut ObservationTable,
    key: Key,
    derived: Value,
    tolerance: &Tolerance,
    stage: &str,
    report: &mut Report,
) {
    match (table.get(&key).copied(), derived) {
        (None | Some(Value::Missing), _) => {
            table.merge(key, derived);
        }
        (Some(Value::Number(reported)), Value::Number(derived)) => {
            report
                .findings
                .push(check(&key, derived, reported, tolerance));
        }
        (Some(existing), incoming) if existing != incoming && !incoming.is_missing() => {
            warn!("{stage}: derived {incoming} for {key} disagrees with reported {existing}");
            report.conflicts.push(Conflict {
                key,
                stage: stage.into(),
                kept: existing,
                discarded: incoming,
            });
        }
        _ => {}
    }
}
