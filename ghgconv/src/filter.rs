//! Row removal by named predicates.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::observation::ObservationTable;
use crate::pipeline::Stage;
use crate::report::Report;
use crate::selection::{CompiledSelection, Selection};

/// Where in the pipeline a filter runs. Filters meant to keep rows (e.g. memo items) out of
/// sums must run before aggregation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum FilterPoint {
    BeforeMapping,
    BeforeAggregation,
    #[default]
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub stage: FilterPoint,
    pub remove: Selection,
}

/// Removes every row matched by any of its named selections.
#[derive(Debug, Clone)]
pub struct RowFilter {
    point: FilterPoint,
    filters: Vec<(String, CompiledSelection)>,
}

impl RowFilter {
    /// Compiles the filters declared for `point`. Returns `None` when there are none.
    pub fn new(point: FilterPoint, specs: &BTreeMap<String, FilterSpec>) -> Result<Option<Self>> {
        let filters = specs
            .iter()
            .filter(|(_, spec)| spec.stage == point)
            .map(|(name, spec)| Ok((name.clone(), spec.remove.compile()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok((!filters.is_empty()).then_some(Self { point, filters }))
    }
}

impl Stage for RowFilter {
    fn name(&self) -> &'static str {
        match self.point {
            FilterPoint::BeforeMapping => "filter (before mapping)",
            FilterPoint::BeforeAggregation => "filter (before aggregation)",
            FilterPoint::Final => "filter (final)",
        }
    }

    fn apply(&self, table: &mut ObservationTable, _report: &mut Report) -> Result<()> {
        let mut removed: BTreeMap<&str, usize> = BTreeMap::new();
        table.retain(|key, _| {
            match self.filters.iter().find(|(_, selection)| selection.matches(key)) {
                Some((name, _)) => {
                    *removed.entry(name.as_str()).or_default() += 1;
                    false
                }
                None => true,
            }
        });
        debug!("{}: removed rows per filter {removed:?}", self.name());
        info!(
            "{}: removed {} rows",
            self.name(),
            removed.values().sum::<usize>()
        );
        Ok(())
    }
}
