//! Aggregator: derives target categories as sums of other categories.
//!
//! Rules are executed one after another against the accumulating table, so a rule may use the
//! output of an earlier rule. The execution order is a stable topological order of the
//! dependency graph between rules, with declaration order as tie-break.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::consistency::{reconcile, Tolerance};
use crate::error::{ConversionError, Result};
use crate::observation::{Key, Marker, ObservationTable, Value};
use crate::pipeline::Stage;
use crate::report::Report;
use crate::selection::{CompiledSelection, Selection};
use crate::taxonomy::Taxonomy;

fn default_min_count() -> usize {
    1
}

/// `target = sum(sources)` for every combination of the other dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRule {
    pub target: String,
    /// Codes to sum. When empty, the direct children of `target` in the target taxonomy.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Restricts the rows (e.g. entities) the rule applies to.
    #[serde(default)]
    pub filter: Option<Selection>,
    /// Tolerance for the check against an independently reported value at `target`.
    #[serde(default)]
    pub tolerance: Option<Tolerance>,
    /// Minimum number of non-null contributors for a sum to be produced.
    #[serde(default = "default_min_count")]
    pub min_count: usize,
}

impl AggregationRule {
    pub fn new<I, S>(target: &str, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into(),
            sources: sources.into_iter().map(Into::into).collect(),
            filter: None,
            tolerance: None,
            min_count: default_min_count(),
        }
    }
}

/// Running sum with "skip nulls, count contributors" semantics.
#[derive(Debug, Default)]
pub(crate) struct Accumulator {
    sum: f64,
    numbers: usize,
    rows: usize,
    markers: BTreeSet<Marker>,
    marker_rows: usize,
}

impl Accumulator {
    pub(crate) fn add(&mut self, value: &Value) {
        self.rows += 1;
        match value {
            Value::Number(n) => {
                self.sum += n;
                self.numbers += 1;
            }
            Value::Marker(m) => {
                self.markers.insert(*m);
                self.marker_rows += 1;
            }
            Value::Missing => {}
        }
    }

    /// The sum if at least `min_count` numbers contributed. Without any number, a marker
    /// shared by every contributing row is carried over. Otherwise the result is null.
    pub(crate) fn finish(&self, min_count: usize) -> Value {
        if self.numbers > 0 && self.numbers >= min_count {
            return Value::Number(self.sum);
        }
        if self.numbers == 0 && self.marker_rows == self.rows && self.markers.len() == 1 {
            if let Some(marker) = self.markers.first() {
                return Value::Marker(*marker);
            }
        }
        Value::Missing
    }
}

#[derive(Debug, Clone)]
struct ResolvedRule {
    target: String,
    sources: BTreeSet<String>,
    filter: CompiledSelection,
    tolerance: Tolerance,
    min_count: usize,
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    rules: Vec<ResolvedRule>,
}

impl Aggregator {
    /// Validates the rules against the target taxonomy and orders them by dependency.
    pub fn new(
        rules: &[AggregationRule],
        taxonomy: &Taxonomy,
        default_tolerance: Tolerance,
    ) -> Result<Self> {
        let resolved = rules
            .iter()
            .map(|rule| resolve(rule, taxonomy, default_tolerance))
            .collect::<Result<Vec<_>>>()?;
        let order = execution_order(&resolved)?;
        debug!(
            "Aggregation order: {}",
            order.iter().map(|&i| &resolved[i].target).join(", ")
        );
        let mut slots = resolved.into_iter().map(Some).collect_vec();
        let rules = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();
        Ok(Self { rules })
    }

    /// Targets in execution order.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.target.as_str())
    }
}

fn resolve(
    rule: &AggregationRule,
    taxonomy: &Taxonomy,
    default_tolerance: Tolerance,
) -> Result<ResolvedRule> {
    if !taxonomy.contains(&rule.target) {
        return Err(ConversionError::UnknownTargetCode {
            context: "aggregation target".into(),
            code: rule.target.clone(),
            taxonomy: taxonomy.name.clone(),
        });
    }
    let sources: BTreeSet<String> = if rule.sources.is_empty() {
        taxonomy.children(&rule.target).map(String::from).collect()
    } else {
        rule.sources.iter().cloned().collect()
    };
    if sources.is_empty() {
        return Err(ConversionError::EmptyAggregation(rule.target.clone()));
    }
    if sources.contains(&rule.target) {
        return Err(ConversionError::SelfReference(rule.target.clone()));
    }
    let filter = match &rule.filter {
        Some(selection) => selection.compile()?,
        None => CompiledSelection::default(),
    };
    Ok(ResolvedRule {
        target: rule.target.clone(),
        sources,
        filter,
        tolerance: rule.tolerance.unwrap_or(default_tolerance),
        min_count: rule.min_count,
    })
}

/// Orders rules so that every rule runs after the rules producing what it consumes. Among
/// ready rules the earliest declared runs first. On a cycle, returns the indices along it with
/// the first index repeated at the end.
pub(crate) fn dependency_order<'a>(
    produces: &[BTreeSet<&'a str>],
    consumes: &[BTreeSet<&'a str>],
) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let dependencies: Vec<BTreeSet<usize>> = consumes
        .iter()
        .map(|inputs| {
            (0..produces.len())
                .filter(|&j| !produces[j].is_disjoint(inputs))
                .collect()
        })
        .collect();

    let mut remaining: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = (0..consumes.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(consumes.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for (i, deps) in dependencies.iter().enumerate() {
            if deps.contains(&next) {
                remaining[i] -= 1;
                if remaining[i] == 0 {
                    ready.insert(i);
                }
            }
        }
    }
    if order.len() < consumes.len() {
        let done: BTreeSet<usize> = order.into_iter().collect();
        return Err(find_cycle(&dependencies, &done));
    }
    Ok(order)
}

/// Every unscheduled rule has an unscheduled dependency, so walking dependencies from any of
/// them must revisit a rule.
fn find_cycle(dependencies: &[BTreeSet<usize>], done: &BTreeSet<usize>) -> Vec<usize> {
    let Some(start) = (0..dependencies.len()).find(|i| !done.contains(i)) else {
        return vec![];
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = dependencies[current].iter().find(|&d| !done.contains(d)) else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            path.drain(..pos);
            path.push(next);
            break;
        }
        path.push(next);
        current = next;
    }
    path
}

fn execution_order(rules: &[ResolvedRule]) -> Result<Vec<usize>> {
    let produces = rules
        .iter()
        .map(|rule| BTreeSet::from([rule.target.as_str()]))
        .collect_vec();
    let consumes = rules
        .iter()
        .map(|rule| rule.sources.iter().map(String::as_str).collect::<BTreeSet<_>>())
        .collect_vec();
    dependency_order(&produces, &consumes).map_err(|cycle| {
        ConversionError::AggregationCycle(
            cycle.into_iter().map(|i| rules[i].target.clone()).collect(),
        )
    })
}

impl Stage for Aggregator {
    fn name(&self) -> &'static str {
        "aggregation"
    }

    fn apply(&self, table: &mut ObservationTable, report: &mut Report) -> Result<()> {
        for rule in &self.rules {
            let mut groups: BTreeMap<Key, Accumulator> = BTreeMap::new();
            for (key, value) in table.iter() {
                if rule.sources.contains(&key.category) && rule.filter.matches(key) {
                    groups
                        .entry(key.with_category(&rule.target))
                        .or_default()
                        .add(value);
                }
            }
            let before = table.len();
            let findings = report.findings.len();
            for (target_key, acc) in groups {
                reconcile(
                    table,
                    target_key,
                    acc.finish(rule.min_count),
                    &rule.tolerance,
                    self.name(),
                    report,
                );
            }
            debug!(
                "Aggregated {} from [{}]: {} new rows, {} checks against reported values",
                rule.target,
                rule.sources.iter().join(", "),
                table.len() - before,
                report.findings.len() - findings
            );
        }
        info!("Applied {} aggregation rules", self.rules.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::observation::tests::{key, table};

    use super::*;

    fn taxonomy() -> Taxonomy {
        Taxonomy::new(
            "IPCC2006_PRIMAP",
            ["0", "1", "1.A", "1.B", "3", "3.A.1", "3.A.2", "M.AG", "M.0.EL", "M.LULUCF"],
        )
    }

    fn aggregate(rules: &[AggregationRule], t: &mut ObservationTable) -> Report {
        let mut report = Report::default();
        Aggregator::new(rules, &taxonomy(), Tolerance::default())
            .unwrap()
            .apply(t, &mut report)
            .unwrap();
        report
    }

    #[test]
    fn sources_are_summed_into_target() {
        let mut t = table(&[
            ("3.A.1", "CH4", 2000, Value::Number(10.0)),
            ("3.A.2", "CH4", 2000, Value::Number(5.0)),
        ]);
        aggregate(&[AggregationRule::new("M.AG", ["3.A.1", "3.A.2"])], &mut t);
        assert_eq!(t.get(&key("M.AG", "CH4", 2000)), Some(&Value::Number(15.0)));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn nulls_are_skipped_and_all_null_gives_null() {
        let mut t = table(&[
            ("3.A.1", "CH4", 2000, Value::Number(10.0)),
            ("3.A.2", "CH4", 2000, Value::Missing),
            ("3.A.1", "CH4", 2001, Value::Missing),
            ("3.A.2", "CH4", 2001, Value::Missing),
        ]);
        aggregate(&[AggregationRule::new("M.AG", ["3.A.1", "3.A.2"])], &mut t);
        assert_eq!(t.get(&key("M.AG", "CH4", 2000)), Some(&Value::Number(10.0)));
        assert_eq!(t.get(&key("M.AG", "CH4", 2001)), Some(&Value::Missing));
    }

    #[test]
    fn null_sum_does_not_replace_reported_total() {
        let mut t = table(&[
            ("3.A.1", "CH4", 2000, Value::Missing),
            ("3.A.2", "CH4", 2000, Value::Missing),
            ("M.AG", "CH4", 2000, Value::Number(4.0)),
        ]);
        let report = aggregate(&[AggregationRule::new("M.AG", ["3.A.1", "3.A.2"])], &mut t);
        assert_eq!(t.get(&key("M.AG", "CH4", 2000)), Some(&Value::Number(4.0)));
        assert!(report.is_clean());
    }

    #[test]
    fn absent_sources_produce_no_zero_rows() {
        let mut t = table(&[("3.A.1", "CH4", 2000, Value::Number(1.0))]);
        aggregate(&[AggregationRule::new("M.AG", ["3.A.1", "3.A.2"])], &mut t);
        assert_eq!(t.get(&key("M.AG", "CH4", 2001)), None);
        assert_eq!(t.get(&key("M.AG", "N2O", 2000)), None);
    }

    #[test]
    fn min_count_requires_enough_contributors() {
        let mut t = table(&[
            ("3.A.1", "CH4", 2000, Value::Number(10.0)),
            ("3.A.2", "CH4", 2000, Value::Missing),
        ]);
        let mut rule = AggregationRule::new("M.AG", ["3.A.1", "3.A.2"]);
        rule.min_count = 2;
        aggregate(&[rule], &mut t);
        assert_eq!(t.get(&key("M.AG", "CH4", 2000)), Some(&Value::Missing));
    }

    #[test]
    fn shared_marker_is_carried_over() {
        let mut t = table(&[
            ("3.A.1", "CH4", 2000, Value::Marker(Marker::NO)),
            ("3.A.2", "CH4", 2000, Value::Marker(Marker::NO)),
            ("3.A.1", "CH4", 2001, Value::Marker(Marker::NO)),
            ("3.A.2", "CH4", 2001, Value::Marker(Marker::NE)),
        ]);
        aggregate(&[AggregationRule::new("M.AG", ["3.A.1", "3.A.2"])], &mut t);
        assert_eq!(
            t.get(&key("M.AG", "CH4", 2000)),
            Some(&Value::Marker(Marker::NO))
        );
        assert_eq!(t.get(&key("M.AG", "CH4", 2001)), Some(&Value::Missing));
    }

    #[test]
    fn chained_rules_run_in_dependency_order() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(1.0)),
            ("1.B", "CO2", 2000, Value::Number(2.0)),
            ("3", "CO2", 2000, Value::Number(4.0)),
        ]);
        // Declared in the wrong order on purpose
        let rules = [
            AggregationRule::new("0", ["1", "3"]),
            AggregationRule::new("1", ["1.A", "1.B"]),
        ];
        let aggregator = Aggregator::new(&rules, &taxonomy(), Tolerance::default()).unwrap();
        assert_eq!(aggregator.targets().collect_vec(), vec!["1", "0"]);
        aggregate(&rules, &mut t);
        assert_eq!(t.get(&key("0", "CO2", 2000)), Some(&Value::Number(7.0)));
    }

    #[test]
    fn empty_sources_default_to_taxonomy_children() {
        let mut t = table(&[
            ("1.A", "CO2", 2000, Value::Number(1.0)),
            ("1.B", "CO2", 2000, Value::Number(2.0)),
        ]);
        aggregate(&[AggregationRule::new("1", Vec::<String>::new())], &mut t);
        assert_eq!(t.get(&key("1", "CO2", 2000)), Some(&Value::Number(3.0)));
    }

    #[test]
    fn filter_restricts_entities() {
        let mut t = table(&[
            ("3.A.1", "CH4", 2000, Value::Number(1.0)),
            ("3.A.1", "N2O", 2000, Value::Number(1.0)),
        ]);
        let mut rule = AggregationRule::new("M.AG", ["3.A.1"]);
        rule.filter = Some(Selection::new().with(crate::observation::Dimension::Entity, ["CH4"]));
        aggregate(&[rule], &mut t);
        assert!(t.contains_key(&key("M.AG", "CH4", 2000)));
        assert!(!t.contains_key(&key("M.AG", "N2O", 2000)));
    }

    #[test]
    fn reported_total_wins_and_is_checked() {
        let mut t = table(&[
            ("1", "CO2", 2000, Value::Number(60.0)),
            ("M.LULUCF", "CO2", 2000, Value::Number(40.0)),
            ("M.0.EL", "CO2", 2000, Value::Number(103.0)),
        ]);
        let mut rule = AggregationRule::new("M.0.EL", ["1", "M.LULUCF"]);
        rule.tolerance = Some(Tolerance::relative(0.01));
        let report = aggregate(&[rule], &mut t);
        assert_eq!(t.get(&key("M.0.EL", "CO2", 2000)), Some(&Value::Number(103.0)));
        let failures = report.failures().collect_vec();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].derived, 100.0);
        assert_eq!(failures[0].discrepancy, 3.0);
    }

    #[test]
    fn self_reference_is_rejected() {
        let err = Aggregator::new(
            &[AggregationRule::new("1", ["1", "1.A"])],
            &taxonomy(),
            Tolerance::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::SelfReference(t) if t == "1"));
    }

    #[test]
    fn cycles_are_rejected() {
        let err = Aggregator::new(
            &[
                AggregationRule::new("M.AG", ["3.A.1"]),
                AggregationRule::new("1", ["0"]),
                AggregationRule::new("0", ["1"]),
            ],
            &taxonomy(),
            Tolerance::default(),
        )
        .unwrap_err();
        match err {
            ConversionError::AggregationCycle(path) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"0".to_string()) && path.contains(&"1".to_string()));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = Aggregator::new(
            &[AggregationRule::new("9.Z", ["1"])],
            &taxonomy(),
            Tolerance::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConversionError::UnknownTargetCode { .. }));
    }

    #[test]
    fn rule_should_deserialize_with_defaults() -> anyhow::Result<()> {
        let rule: AggregationRule =
            serde_json::from_str(r#"{"target": "M.AG", "sources": ["3.A.1", "3.A.2"]}"#)?;
        assert_eq!(rule, AggregationRule::new("M.AG", ["3.A.1", "3.A.2"]));
        Ok(())
    }
}
