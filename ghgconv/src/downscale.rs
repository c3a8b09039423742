//! Distribution of basket-only time points across the basket's declared parts.
//!
//! A time point where the basket and (some of) its parts are known, and the known parts add up
//! to the basket, is a reference. Time points where the basket is known and no part is
//! reported at all are filled using the shares of the references: shares are interpolated
//! linearly between references and held constant before the first and after the last.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::consistency::Tolerance;
use crate::error::{ConversionError, Result};
use crate::observation::{Dimension, Key, Merge, ObservationTable, Value};
use crate::pipeline::Stage;
use crate::report::{DownscaleIssue, DownscaleWarning, Report};
use crate::selection::{CompiledSelection, Selection};
use crate::taxonomy::Taxonomy;

fn default_dimension() -> Dimension {
    Dimension::Category
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownscaleRule {
    pub basket: String,
    pub basket_contents: Vec<String>,
    /// Entities the rule applies to when splitting categories. Empty means all.
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default = "default_dimension")]
    pub dim: Dimension,
    #[serde(default)]
    pub filter: Option<Selection>,
    #[serde(default)]
    pub tolerance: Option<Tolerance>,
}

impl DownscaleRule {
    pub fn new<I, S>(basket: &str, contents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            basket: basket.into(),
            basket_contents: contents.into_iter().map(Into::into).collect(),
            entities: vec![],
            dim: Dimension::Category,
            filter: None,
            tolerance: None,
        }
    }
}

#[derive(Debug, Clone)]
struct ResolvedDownscale {
    basket: String,
    contents: Vec<String>,
    entities: BTreeSet<String>,
    dim: Dimension,
    filter: CompiledSelection,
    tolerance: Tolerance,
}

#[derive(Debug, Clone)]
pub struct Downscaler {
    rules: Vec<ResolvedDownscale>,
}

impl Downscaler {
    /// Validates the rules. Category rules must only name codes of `taxonomy`.
    pub fn new(
        rules: &[DownscaleRule],
        taxonomy: &Taxonomy,
        default_tolerance: Tolerance,
    ) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| resolve(rule, taxonomy, default_tolerance))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

fn resolve(
    rule: &DownscaleRule,
    taxonomy: &Taxonomy,
    default_tolerance: Tolerance,
) -> Result<ResolvedDownscale> {
    let invalid = |reason: &str| ConversionError::InvalidDownscale {
        basket: rule.basket.clone(),
        reason: reason.into(),
    };
    if rule.basket_contents.is_empty() {
        return Err(invalid("basket_contents is empty"));
    }
    if !rule.basket_contents.iter().all_unique() {
        return Err(invalid("basket_contents lists a code twice"));
    }
    if rule.basket_contents.contains(&rule.basket) {
        return Err(invalid("the basket is listed among its own contents"));
    }
    match rule.dim {
        Dimension::Category => {
            for code in std::iter::once(&rule.basket).chain(&rule.basket_contents) {
                if !taxonomy.contains(code) {
                    return Err(ConversionError::UnknownTargetCode {
                        context: "downscale rule".into(),
                        code: code.clone(),
                        taxonomy: taxonomy.name.clone(),
                    });
                }
            }
        }
        Dimension::Entity if rule.entities.is_empty() => {}
        Dimension::Entity => {
            return Err(invalid("entities can only restrict category downscaling"));
        }
        other => return Err(invalid(&format!("cannot split along {other}"))),
    }
    let filter = match &rule.filter {
        Some(selection) => selection.compile()?,
        None => CompiledSelection::default(),
    };
    Ok(ResolvedDownscale {
        basket: rule.basket.clone(),
        contents: rule.basket_contents.clone(),
        entities: rule.entities.iter().cloned().collect(),
        dim: rule.dim,
        filter,
        tolerance: rule.tolerance.unwrap_or(default_tolerance),
    })
}

/// One basket series: basket values and part values by time.
#[derive(Debug, Default)]
struct Series {
    basket: BTreeMap<i32, Value>,
    parts: Vec<BTreeMap<i32, Value>>,
}

/// Part values at a reference time, with their sum.
#[derive(Debug)]
struct Reference {
    time: i32,
    parts: Vec<f64>,
    sum: f64,
}

impl Reference {
    fn share(&self, i: usize) -> f64 {
        self.parts[i] / self.sum
    }
}

enum Plan {
    Split(Vec<Reference>, Vec<(i32, f64)>),
    Refused(i32, DownscaleIssue),
    Untouched,
}

impl ResolvedDownscale {
    fn applies_to(&self, key: &Key) -> bool {
        (self.entities.is_empty() || self.entities.contains(&key.entity))
            && self.filter.matches(key)
    }

    fn collect(&self, table: &ObservationTable) -> BTreeMap<Key, Series> {
        let mut series: BTreeMap<Key, Series> = BTreeMap::new();
        for (key, value) in table.iter() {
            if !self.applies_to(key) {
                continue;
            }
            let code = key.get(self.dim);
            let slot = if *code == *self.basket {
                None
            } else if let Some(i) = self.contents.iter().position(|c| **c == *code) {
                Some(i)
            } else {
                continue;
            };
            let entry = series
                .entry(key.with(self.dim, &self.basket).at_time(0))
                .or_insert_with(|| Series {
                    basket: BTreeMap::new(),
                    parts: vec![BTreeMap::new(); self.contents.len()],
                });
            match slot {
                None => entry.basket.insert(key.time, *value),
                Some(i) => entry.parts[i].insert(key.time, *value),
            };
        }
        series
    }

    fn plan(&self, series: &Series) -> Plan {
        let mut references = vec![];
        let mut gaps = vec![];
        for (&time, value) in &series.basket {
            let Some(basket) = value.as_number() else {
                continue;
            };
            let present = series
                .parts
                .iter()
                .map(|part| part.get(&time).filter(|v| !v.is_missing()))
                .collect_vec();
            if present.iter().all(Option::is_none) {
                gaps.push((time, basket));
                continue;
            }
            let numbers = present
                .iter()
                .map(|v| v.and_then(Value::as_number))
                .collect_vec();
            if numbers.iter().all(Option::is_none) {
                // Only markers reported, nothing to learn from or to fill
                continue;
            }
            let parts = numbers.iter().map(|n| n.unwrap_or(0.0)).collect_vec();
            let sum: f64 = parts.iter().sum();
            if self.tolerance.within(sum, basket) {
                if sum != 0.0 {
                    references.push(Reference { time, parts, sum });
                }
            } else if sum > basket || numbers.iter().all(Option::is_some) {
                return Plan::Refused(
                    time,
                    DownscaleIssue::SumMismatch {
                        time,
                        basket_value: basket,
                        sum,
                    },
                );
            } else {
                return Plan::Refused(time, DownscaleIssue::PartialDetail { time });
            }
        }
        match (references.is_empty(), gaps.first()) {
            (_, None) => Plan::Untouched,
            (true, Some(&(time, _))) => Plan::Refused(time, DownscaleIssue::NoReferenceRatio),
            (false, Some(_)) => Plan::Split(references, gaps),
        }
    }
}

/// The portion of `basket` attributed to part `i` at `time`.
fn portion(references: &[Reference], time: i32, basket: f64, i: usize) -> f64 {
    match references.iter().position(|r| r.time >= time) {
        Some(0) => basket * references[0].parts[i] / references[0].sum,
        None => {
            let last = &references[references.len() - 1];
            basket * last.parts[i] / last.sum
        }
        Some(j) => {
            let (r0, r1) = (&references[j - 1], &references[j]);
            let w = f64::from(time - r0.time) / f64::from(r1.time - r0.time);
            let (s0, s1) = (r0.share(i), r1.share(i));
            basket * (s0 + w * (s1 - s0))
        }
    }
}

impl Stage for Downscaler {
    fn name(&self) -> &'static str {
        "downscale"
    }

    fn apply(&self, table: &mut ObservationTable, report: &mut Report) -> Result<()> {
        for rule in &self.rules {
            let mut filled = 0;
            for (series_key, series) in rule.collect(table) {
                let (references, gaps) = match rule.plan(&series) {
                    Plan::Untouched => continue,
                    Plan::Refused(time, issue) => {
                        warn!(
                            "Not downscaling {} for {}: {issue:?}",
                            rule.basket,
                            series_key.at_time(time)
                        );
                        report.downscale_warnings.push(DownscaleWarning {
                            series: series_key.at_time(time),
                            basket: rule.basket.clone(),
                            issue,
                        });
                        continue;
                    }
                    Plan::Split(references, gaps) => (references, gaps),
                };
                for (time, basket) in gaps {
                    for (i, code) in rule.contents.iter().enumerate() {
                        let value = portion(&references, time, basket, i);
                        let key = series_key.with(rule.dim, code).at_time(time);
                        if matches!(
                            table.merge(key, Value::Number(value)),
                            Merge::Inserted | Merge::Filled
                        ) {
                            filled += 1;
                        }
                    }
                }
            }
            debug!(
                "Downscaled {} into [{}]: {filled} values",
                rule.basket,
                rule.contents.join(", ")
            );
        }
        info!("Applied {} downscale rules", self.rules.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::observation::tests::{key, table};
    use crate::observation::Marker;

    use super::*;

    fn taxonomy() -> Taxonomy {
        Taxonomy::new("IPCC2006", ["1", "1.A", "1.A.1", "1.A.2", "1.B"])
    }

    fn run(rule: DownscaleRule, t: &mut ObservationTable) -> Report {
        let mut report = Report::default();
        Downscaler::new(&[rule], &taxonomy(), Tolerance::default())
            .unwrap()
            .apply(t, &mut report)
            .unwrap();
        report
    }

    #[test]
    fn basket_is_split_with_reference_ratio() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(10.0)),
            ("1.A.1", "CO2", 2000, Value::Number(6.0)),
            ("1.A.2", "CO2", 2000, Value::Number(4.0)),
            ("1.A", "CO2", 2010, Value::Number(50.0)),
        ]);
        let report = run(DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]), &mut t);
        assert!(report.downscale_warnings.is_empty());
        assert_eq!(t.get(&key("1.A.1", "CO2", 2010)), Some(&Value::Number(30.0)));
        assert_eq!(t.get(&key("1.A.2", "CO2", 2010)), Some(&Value::Number(20.0)));
        assert_eq!(t.get(&key("1.A", "CO2", 2010)), Some(&Value::Number(50.0)));
    }

    #[test]
    fn shares_are_interpolated_between_references() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(100.0)),
            ("1.A.1", "CO2", 2000, Value::Number(50.0)),
            ("1.A.2", "CO2", 2000, Value::Number(50.0)),
            ("1.A", "CO2", 2004, Value::Number(100.0)),
            ("1.A.1", "CO2", 2004, Value::Number(90.0)),
            ("1.A.2", "CO2", 2004, Value::Number(10.0)),
            ("1.A", "CO2", 2002, Value::Number(200.0)),
            ("1.A", "CO2", 2008, Value::Number(10.0)),
        ]);
        run(DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]), &mut t);
        let value = |c, y| t.get(&key(c, "CO2", y)).and_then(Value::as_number).unwrap();
        assert!((value("1.A.1", 2002) - 140.0).abs() < 1e-9);
        assert!((value("1.A.2", 2002) - 60.0).abs() < 1e-9);
        // Held at the last reference ratio
        assert!((value("1.A.1", 2008) - 9.0).abs() < 1e-9);
        assert!((value("1.A.2", 2008) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn split_conserves_the_basket() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(3.0)),
            ("1.A.1", "CO2", 2000, Value::Number(1.0)),
            ("1.A.2", "CO2", 2000, Value::Number(2.0)),
            ("1.A", "CO2", 2001, Value::Number(7.3)),
        ]);
        run(DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]), &mut t);
        let sum: f64 = ["1.A.1", "1.A.2"]
            .iter()
            .filter_map(|c| t.get(&key(c, "CO2", 2001)).and_then(Value::as_number))
            .sum();
        assert!(Tolerance::default().within(sum, 7.3));
    }

    #[test]
    fn no_reference_leaves_basket_unsplit() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(10.0)),
            ("1.A", "CO2", 2001, Value::Number(11.0)),
        ]);
        let report = run(DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]), &mut t);
        assert_eq!(t.len(), 2);
        assert_eq!(report.downscale_warnings.len(), 1);
        assert_eq!(
            report.downscale_warnings[0].issue,
            DownscaleIssue::NoReferenceRatio
        );
    }

    #[test]
    fn mismatching_detail_refuses_the_split() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(10.0)),
            ("1.A.1", "CO2", 2000, Value::Number(8.0)),
            ("1.A.2", "CO2", 2000, Value::Number(4.0)),
            ("1.A", "CO2", 2001, Value::Number(11.0)),
        ]);
        let report = run(DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]), &mut t);
        assert_eq!(t.get(&key("1.A.1", "CO2", 2001)), None);
        assert_eq!(
            report.downscale_warnings[0].issue,
            DownscaleIssue::SumMismatch {
                time: 2000,
                basket_value: 10.0,
                sum: 12.0
            }
        );
    }

    #[test]
    fn absent_part_counts_as_zero_share_when_known_parts_add_up() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(10.0)),
            ("1.A.1", "CO2", 2000, Value::Number(10.0)),
            ("1.A", "CO2", 2001, Value::Number(20.0)),
        ]);
        let report = run(DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]), &mut t);
        assert!(report.downscale_warnings.is_empty());
        assert_eq!(t.get(&key("1.A.1", "CO2", 2001)), Some(&Value::Number(20.0)));
        assert_eq!(t.get(&key("1.A.2", "CO2", 2001)), Some(&Value::Number(0.0)));
    }

    #[test]
    fn partial_detail_below_basket_is_reported() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(10.0)),
            ("1.A.1", "CO2", 2000, Value::Number(4.0)),
            ("1.A", "CO2", 2001, Value::Number(20.0)),
        ]);
        let report = run(DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]), &mut t);
        assert_eq!(
            report.downscale_warnings[0].issue,
            DownscaleIssue::PartialDetail { time: 2000 }
        );
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn markers_are_neither_references_nor_gaps() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(10.0)),
            ("1.A.1", "CO2", 2000, Value::Number(6.0)),
            ("1.A.2", "CO2", 2000, Value::Number(4.0)),
            ("1.A", "CO2", 2001, Value::Number(20.0)),
            ("1.A.1", "CO2", 2001, Value::Marker(Marker::IE)),
            ("1.A.2", "CO2", 2001, Value::Marker(Marker::IE)),
        ]);
        let report = run(DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]), &mut t);
        assert!(report.downscale_warnings.is_empty());
        assert_eq!(
            t.get(&key("1.A.1", "CO2", 2001)),
            Some(&Value::Marker(Marker::IE))
        );
    }

    #[test]
    fn entities_restrict_the_rule() {
        let mut t = table(&[
            ("1.A", "CH4", 2000, Value::Number(10.0)),
            ("1.A.1", "CH4", 2000, Value::Number(6.0)),
            ("1.A.2", "CH4", 2000, Value::Number(4.0)),
            ("1.A", "CH4", 2001, Value::Number(50.0)),
        ]);
        let mut rule = DownscaleRule::new("1.A", ["1.A.1", "1.A.2"]);
        rule.entities = vec!["CO2".into()];
        run(rule, &mut t);
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn entities_can_be_split_too() {
        let mut t = table(&[
            ("1", "FGASES (AR4GWP100)", 2000, Value::Number(10.0)),
            ("1", "HFCS (AR4GWP100)", 2000, Value::Number(7.0)),
            ("1", "PFCS (AR4GWP100)", 2000, Value::Number(3.0)),
            ("1", "FGASES (AR4GWP100)", 2001, Value::Number(20.0)),
        ]);
        let mut rule = DownscaleRule::new(
            "FGASES (AR4GWP100)",
            ["HFCS (AR4GWP100)", "PFCS (AR4GWP100)"],
        );
        rule.dim = Dimension::Entity;
        run(rule, &mut t);
        assert_eq!(
            t.get(&key("1", "HFCS (AR4GWP100)", 2001)),
            Some(&Value::Number(14.0))
        );
        assert_eq!(
            t.get(&key("1", "PFCS (AR4GWP100)", 2001)),
            Some(&Value::Number(6.0))
        );
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let bad = [
            DownscaleRule::new("1.A", Vec::<String>::new()),
            DownscaleRule::new("1.A", ["1.A.1", "1.A.1"]),
            DownscaleRule::new("1.A", ["1.A", "1.A.1"]),
        ];
        for rule in bad {
            let err = Downscaler::new(&[rule], &taxonomy(), Tolerance::default()).unwrap_err();
            assert!(matches!(err, ConversionError::InvalidDownscale { .. }));
        }
        let err = Downscaler::new(
            &[DownscaleRule::new("1.A", ["1.A.1", "1.A.9"])],
            &taxonomy(),
            Tolerance::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::UnknownTargetCode { code, .. } if code == "1.A.9"));
        let mut rule = DownscaleRule::new("1.A", ["1.A.1"]);
        rule.dim = Dimension::Time;
        assert!(Downscaler::new(&[rule], &taxonomy(), Tolerance::default()).is_err());
    }

    #[test]
    fn rule_should_deserialize() -> anyhow::Result<()> {
        let rule: DownscaleRule = serde_json::from_str(
            r#"{"basket": "1.A", "basket_contents": ["1.A.1", "1.A.2"],
                "entities": ["CO2"], "tolerance": {"relative": 0.05}}"#,
        )?;
        assert_eq!(rule.dim, Dimension::Category);
        assert_eq!(rule.tolerance, Some(Tolerance::relative(0.05)));
        Ok(())
    }
}
