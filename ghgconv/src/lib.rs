use log::{debug, warn};
use polars::frame::DataFrame;

use crate::config::Config;
use crate::conversion_spec::ConversionSpec;
use crate::error::Result;
use crate::observation::ObservationTable;
use crate::pipeline::{Pipeline, StageSummary};

// Re-exports
pub use column_names as COL;
pub use pipeline::{Conversion, Stage};

// Modules
pub mod aggregate;
pub mod basket;
pub mod column_names;
pub mod config;
pub mod consistency;
pub mod conversion_spec;
pub mod downscale;
pub mod entity;
pub mod error;
pub mod filter;
pub mod frame;
pub mod mapping;
pub mod observation;
pub mod pipeline;
pub mod report;
pub mod selection;
pub mod taxonomy;
pub mod units;

/// Entry point for converting emissions tables between category taxonomies
#[derive(Debug, Clone, Default)]
pub struct Converter {
    pub config: Config,
}

impl Converter {
    /// Setup the Converter with default configuration
    pub fn new() -> Self {
        Self::new_with_config(Config::default())
    }

    /// Setup the Converter with custom configuration
    pub fn new_with_config(config: Config) -> Self {
        debug!("config: {config:?}");
        Self { config }
    }

    /// Validates `spec` and builds the stages it describes
    pub fn plan(&self, spec: &ConversionSpec) -> Result<Pipeline> {
        Pipeline::from_spec(spec, &self.config)
    }

    /// Converts `table` as described by `spec`
    pub fn convert(&self, spec: &ConversionSpec, table: ObservationTable) -> Result<Conversion> {
        self.plan(spec)?.run(table)
    }

    /// Converts an interchange `DataFrame`. Conflicting duplicate input rows are reported
    /// alongside the conversion findings.
    pub fn convert_dataframe(
        &self,
        spec: &ConversionSpec,
        df: &DataFrame,
    ) -> Result<(DataFrame, Conversion)> {
        self.convert_dataframe_with_summary(spec, df)
            .map(|(out, conversion, _)| (out, conversion))
    }

    /// As [`Converter::convert_dataframe`], also returning the row counts per stage.
    pub fn convert_dataframe_with_summary(
        &self,
        spec: &ConversionSpec,
        df: &DataFrame,
    ) -> Result<(DataFrame, Conversion, Vec<StageSummary>)> {
        let pipeline = self.plan(spec)?;
        let (table, conflicts) = ObservationTable::from_dataframe(df)?;
        for conflict in &conflicts {
            warn!(
                "Duplicate input row {}: kept {}, discarded {}",
                conflict.key, conflict.kept, conflict.discarded
            );
        }
        let (mut conversion, summary) = pipeline.run_with_summary(table)?;
        let later = std::mem::take(&mut conversion.report.conflicts);
        conversion.report.conflicts = conflicts.into_iter().chain(later).collect();
        Ok((conversion.table.to_dataframe()?, conversion, summary))
    }
}
