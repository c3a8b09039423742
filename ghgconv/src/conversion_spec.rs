use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregationRule;
use crate::basket::{BasketDefinition, GwpReplication};
use crate::config::Config;
use crate::downscale::DownscaleRule;
use crate::error::Result;
use crate::filter::FilterSpec;
use crate::mapping::{MappingMode, MappingSpec};
use crate::pipeline::Pipeline;
use crate::taxonomy::Taxonomy;

/// Where the converted numbers come from.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Provenance {
    pub document: Option<String>,
    #[serde(default)]
    pub pages: Vec<String>,
    pub submitted: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Taxonomies {
    #[serde(default)]
    pub source: Option<Taxonomy>,
    pub target: Taxonomy,
}

/// Everything needed to convert one submission to the target taxonomy.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversionSpec {
    #[serde(default)]
    pub provenance: Provenance,
    pub taxonomies: Taxonomies,
    #[serde(default)]
    pub mapping: Option<MappingSpec>,
    /// Overrides [`Config::mapping_mode`].
    #[serde(default)]
    pub mapping_mode: Option<MappingMode>,
    #[serde(default)]
    pub entity_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub aggregation: Vec<AggregationRule>,
    #[serde(default)]
    pub baskets: Vec<BasketDefinition>,
    #[serde(default)]
    pub gwp_replication: Vec<GwpReplication>,
    #[serde(default)]
    pub downscale: Vec<DownscaleRule>,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterSpec>,
    /// Entities accepted as basket constituents besides the known gases.
    #[serde(default)]
    pub entities: Vec<String>,
}

impl ConversionSpec {
    /// An empty specification converting into `target`.
    pub fn new(target: Taxonomy) -> Self {
        Self {
            provenance: Provenance::default(),
            taxonomies: Taxonomies {
                source: None,
                target,
            },
            mapping: None,
            mapping_mode: None,
            entity_mapping: BTreeMap::new(),
            aggregation: vec![],
            baskets: vec![],
            gwp_replication: vec![],
            downscale: vec![],
            filters: BTreeMap::new(),
            entities: vec![],
        }
    }

    /// Checks every rule without running anything.
    pub fn validate(&self, config: &Config) -> Result<()> {
        Pipeline::from_spec(self, config).map(|_| ())
    }

    /// Mapping sources that are not codes of the declared source taxonomy. Empty if no source
    /// taxonomy is declared.
    pub fn unknown_source_codes(&self) -> BTreeSet<&str> {
        let (Some(source), Some(mapping)) = (&self.taxonomies.source, &self.mapping) else {
            return BTreeSet::new();
        };
        mapping
            .maps()
            .flat_map(|map| map.keys())
            .filter(|code| !source.contains(code))
            .map(String::as_str)
            .collect()
    }

    /// Entity names that rules may refer to besides the known gases.
    pub(crate) fn declared_entities(&self) -> Vec<String> {
        self.entities
            .iter()
            .chain(self.entity_mapping.values())
            .cloned()
            .collect()
    }
}
