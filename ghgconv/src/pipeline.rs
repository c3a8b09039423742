use enum_dispatch::enum_dispatch;
use log::{debug, info, warn};
use serde::Serialize;

use crate::aggregate::Aggregator;
use crate::basket::GasBasketBuilder;
use crate::config::Config;
use crate::conversion_spec::ConversionSpec;
use crate::downscale::Downscaler;
use crate::error::Result;
use crate::filter::{FilterPoint, RowFilter};
use crate::mapping::{CategoryMapper, MappingMode, MappingSpec};
use crate::observation::ObservationTable;
use crate::report::Report;

/// One step of a conversion. Stages validate their rules when constructed, so `apply` only
/// fails on conditions that depend on the data (e.g. strict mapping).
#[enum_dispatch]
pub trait Stage {
    fn name(&self) -> &'static str;
    fn apply(&self, table: &mut ObservationTable, report: &mut Report) -> Result<()>;
}

#[enum_dispatch(Stage)]
#[derive(Debug, Clone)]
pub enum PipelineStage {
    Filter(RowFilter),
    Mapping(CategoryMapper),
    Aggregation(Aggregator),
    Baskets(GasBasketBuilder),
    Downscale(Downscaler),
}

/// The converted table and everything worth a second look.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversion {
    pub table: ObservationTable,
    pub report: Report,
}

/// Row counts before and after a stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: &'static str,
    pub rows_in: usize,
    pub rows_out: usize,
}

/// The stages of a conversion in their fixed order:
/// filters (before mapping), mapping, filters (before aggregation), aggregation with
/// consistency checks, gas baskets with GWP replication, downscaling, final filters.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn from_spec(spec: &ConversionSpec, config: &Config) -> Result<Self> {
        let target = &spec.taxonomies.target;
        let mode = spec.mapping_mode.unwrap_or(config.mapping_mode);
        let mut stages: Vec<PipelineStage> = vec![];

        if let Some(filter) = RowFilter::new(FilterPoint::BeforeMapping, &spec.filters)? {
            stages.push(filter.into());
        }
        if spec.mapping.is_some() || !spec.entity_mapping.is_empty() || mode == MappingMode::Strict
        {
            let mapping = spec
                .mapping
                .clone()
                .unwrap_or_else(|| MappingSpec::Single {
                    categories: Default::default(),
                });
            for code in spec.unknown_source_codes() {
                warn!(
                    "Mapping source '{code}' is not a code of the source taxonomy '{}'",
                    spec.taxonomies
                        .source
                        .as_ref()
                        .map_or("", |source| source.name.as_str())
                );
            }
            stages.push(
                CategoryMapper::new(mapping, spec.entity_mapping.clone(), mode, target)?.into(),
            );
        }
        if let Some(filter) = RowFilter::new(FilterPoint::BeforeAggregation, &spec.filters)? {
            stages.push(filter.into());
        }
        if !spec.aggregation.is_empty() {
            stages.push(Aggregator::new(&spec.aggregation, target, config.tolerance)?.into());
        }
        if !spec.baskets.is_empty() || !spec.gwp_replication.is_empty() {
            stages.push(
                GasBasketBuilder::new(
                    &spec.baskets,
                    &spec.gwp_replication,
                    &spec.declared_entities(),
                    config.tolerance,
                )?
                .into(),
            );
        }
        if !spec.downscale.is_empty() {
            stages.push(
                Downscaler::new(&spec.downscale, target, config.downscale_tolerance)?.into(),
            );
        }
        if let Some(filter) = RowFilter::new(FilterPoint::Final, &spec.filters)? {
            stages.push(filter.into());
        }
        debug!(
            "Pipeline: {}",
            stages.iter().map(Stage::name).collect::<Vec<_>>().join(" -> ")
        );
        Ok(Self { stages })
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Runs every stage over `table`.
    pub fn run(&self, table: ObservationTable) -> Result<Conversion> {
        self.run_with_summary(table).map(|(conversion, _)| conversion)
    }

    /// As [`Pipeline::run`], also returning the row counts per stage.
    pub fn run_with_summary(
        &self,
        mut table: ObservationTable,
    ) -> Result<(Conversion, Vec<StageSummary>)> {
        let mut report = Report::default();
        let mut summary = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let rows_in = table.len();
            stage.apply(&mut table, &mut report)?;
            info!("{}: {rows_in} -> {} rows", stage.name(), table.len());
            summary.push(StageSummary {
                stage: stage.name(),
                rows_in,
                rows_out: table.len(),
            });
        }
        Ok((Conversion { table, report }, summary))
    }
}
