//! Category mapper: rewrites source-taxonomy codes into the target taxonomy.

use std::collections::{BTreeMap, BTreeSet};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::{ConversionError, Result};
use crate::observation::{Dimension, Key, Merge, ObservationTable};
use crate::pipeline::Stage;
use crate::report::{Conflict, Report};
use crate::taxonomy::Taxonomy;

/// Mapping destination that drops the row instead of renaming it.
pub const IGNORE: &str = "\\IGNORE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MapTarget {
    Code(String),
    Ignore,
}

impl From<String> for MapTarget {
    fn from(value: String) -> Self {
        if value == IGNORE {
            MapTarget::Ignore
        } else {
            MapTarget::Code(value)
        }
    }
}

impl From<MapTarget> for String {
    fn from(value: MapTarget) -> Self {
        match value {
            MapTarget::Code(code) => code,
            MapTarget::Ignore => IGNORE.into(),
        }
    }
}

/// A partial function from source codes to target codes.
pub type CategoryMap = BTreeMap<String, MapTarget>;

/// How the category mapping is shaped: one map for the whole table, or one map per value of a
/// dimension (typically one per extracted table, distinguished by `source`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingSpec {
    Single {
        categories: CategoryMap,
    },
    Keyed {
        dimension: Dimension,
        tables: BTreeMap<String, CategoryMap>,
        /// Used for rows whose dimension value has no table.
        #[serde(default)]
        fallback: CategoryMap,
    },
}

impl MappingSpec {
    fn map_for(&self, key: &Key) -> &CategoryMap {
        match self {
            MappingSpec::Single { categories } => categories,
            MappingSpec::Keyed {
                dimension,
                tables,
                fallback,
            } => tables.get(&*key.get(*dimension)).unwrap_or(fallback),
        }
    }

    pub(crate) fn maps(&self) -> Box<dyn Iterator<Item = &CategoryMap> + '_> {
        match self {
            MappingSpec::Single { categories } => Box::new(std::iter::once(categories)),
            MappingSpec::Keyed {
                tables, fallback, ..
            } => Box::new(tables.values().chain(std::iter::once(fallback))),
        }
    }
}

/// What happens to codes without a mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MappingMode {
    /// Pass the row through unchanged, assuming the code is already a target code.
    #[default]
    Permissive,
    /// Fail when an unmapped code is not a member of the target taxonomy.
    Strict,
}

#[derive(Debug, Clone)]
pub struct CategoryMapper {
    spec: MappingSpec,
    entities: BTreeMap<String, String>,
    mode: MappingMode,
    target: Taxonomy,
}

impl CategoryMapper {
    pub fn new(
        spec: MappingSpec,
        entities: BTreeMap<String, String>,
        mode: MappingMode,
        target: &Taxonomy,
    ) -> Result<Self> {
        for map in spec.maps() {
            for destination in map.values() {
                if let MapTarget::Code(code) = destination {
                    if !target.contains(code) {
                        return Err(ConversionError::UnknownTargetCode {
                            context: "category mapping".into(),
                            code: code.clone(),
                            taxonomy: target.name.clone(),
                        });
                    }
                }
            }
        }
        for renamed in entities.values() {
            renamed.parse::<Entity>()?;
        }
        Ok(Self {
            spec,
            entities,
            mode,
            target: target.clone(),
        })
    }

    /// Returns the rewritten key, or `None` if the row is to be dropped.
    fn map_key(&self, key: &Key, unmapped: &mut BTreeSet<String>) -> Option<Key> {
        let mut mapped = match self.spec.map_for(key).get(&key.category) {
            Some(MapTarget::Ignore) => return None,
            Some(MapTarget::Code(code)) => key.with_category(code),
            None => {
                if !self.target.contains(&key.category) {
                    unmapped.insert(key.category.clone());
                }
                key.clone()
            }
        };
        if let Some(entity) = self.entities.get(&key.entity) {
            mapped.entity = entity.clone();
        }
        Some(mapped)
    }
}

impl Stage for CategoryMapper {
    fn name(&self) -> &'static str {
        "mapping"
    }

    fn apply(&self, table: &mut ObservationTable, report: &mut Report) -> Result<()> {
        let rows_in = table.len();
        let mut unmapped = BTreeSet::new();
        let mut mapped = ObservationTable::new();
        let mut dropped = 0usize;
        for (key, value) in std::mem::take(table) {
            let Some(new_key) = self.map_key(&key, &mut unmapped) else {
                dropped += 1;
                continue;
            };
            if let Merge::Conflict { existing, incoming } = mapped.merge(new_key.clone(), value) {
                warn!("Mapping {key} onto {new_key} conflicts with an earlier row");
                report.conflicts.push(Conflict {
                    key: new_key,
                    stage: self.name().into(),
                    kept: existing,
                    discarded: incoming,
                });
            }
        }
        if !unmapped.is_empty() {
            if self.mode == MappingMode::Strict {
                return Err(ConversionError::UnmappedCodes(unmapped.into_iter().collect()));
            }
            warn!(
                "Codes with no mapping kept as they are: {}",
                unmapped.into_iter().collect::<Vec<_>>().join(", ")
            );
        }
        info!(
            "Mapped {rows_in} rows into taxonomy {}: {} rows, {dropped} ignored",
            self.target.name,
            mapped.len()
        );
        *table = mapped;
        Ok(())
    }
}
